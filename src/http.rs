//! HTTP over the SIM800 embedded stack (`AT+HTTP*`).
//!
//! Lifecycle: `init()` → any number of requests → `term()`. A request is
//! a multi-step handshake: set parameters, fire `AT+HTTPACTION`, wait for
//! the `+HTTPACTION: <method>,<status>,<len>` URC, then pull the body
//! with `AT+HTTPREAD`. The body read and the POST upload each run inside
//! one locked section — the modem interleaves URCs freely, and a stray
//! line in the middle of a binary body would corrupt it.
//!
//! Stack statuses 600–606 are modem-side failures and become errors;
//! real HTTP statuses (1xx–5xx) are returned to the caller as values.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::at::{raise_if_error, AtChannel, CommandOpts};
use crate::error::{Error, Result};

/// Stack status for "HTTP stack busy", the only transient one.
pub const STATUS_STACK_BUSY: u16 = 604;

/// Deadline for the whole `AT+HTTPREAD` exchange.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Settle time after the POST body bytes, before the modem answers.
const HTTPDATA_SETTLE: Duration = Duration::from_millis(300);

/// Response returned by GET/HEAD/POST.
///
/// `status_code` is a native HTTP status (1xx–5xx); `body` holds exactly
/// the number of bytes the `+HTTPACTION` URC declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body as text, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get = 0,
    Post = 1,
    Head = 2,
}

/// HTTP client bound to one bearer context.
pub struct Http<'a> {
    at: &'a AtChannel,
    cid: u8,
    retry_attempts: u32,
    retry_delay: Duration,
    body_timeout: Duration,
}

impl<'a> Http<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel, cid: u8) -> Self {
        Self {
            at,
            cid,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            body_timeout: BODY_READ_TIMEOUT,
        }
    }

    /// Change the stack-busy retry policy (total attempts, inter-attempt
    /// delay).
    #[must_use]
    pub fn with_retry_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    #[cfg(test)]
    fn set_body_timeout(&mut self, timeout: Duration) {
        self.body_timeout = timeout;
    }

    /// Terminate the HTTP service. Best-effort: a not-initialized stack
    /// answers ERROR, which is fine.
    pub fn term(&self) {
        let _ = self.at.command_with(
            "AT+HTTPTERM",
            CommandOpts {
                timeout: Duration::from_secs(5),
                expect_ok: false,
                ..CommandOpts::default()
            },
        );
    }

    /// Initialize the HTTP service, cleaning up any stale session first.
    pub fn init(&self) -> Result<()> {
        self.term();
        self.at.command("AT+HTTPINIT", Duration::from_secs(5))?;
        self.at.command(
            &format!("AT+HTTPPARA=\"CID\",{}", self.cid),
            Duration::from_secs(5),
        )?;
        Ok(())
    }

    /// Execute a GET. Retries on stack-busy (604) per the retry policy.
    pub fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.with_stack_retry(|| {
            self.set_url(url)?;
            self.set_headers(headers)?;
            self.action_and_read(Method::Get, timeout)
        })
    }

    /// Execute a HEAD; the body is always empty.
    pub fn head(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.set_url(url)?;
        self.set_headers(headers)?;
        self.action_and_read(Method::Head, timeout)
    }

    /// Execute a POST: upload the body through the DOWNLOAD prompt, then
    /// fire the action. Retries on stack-busy (604) per the retry policy.
    pub fn post(
        &self,
        url: &str,
        body: &[u8],
        content_type: &str,
        headers: &[(&str, &str)],
        httpdata_timeout_ms: u32,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.with_stack_retry(|| {
            self.set_url(url)?;
            self.at.command(
                &format!("AT+HTTPPARA=\"CONTENT\",\"{content_type}\""),
                Duration::from_secs(5),
            )?;
            self.set_headers(headers)?;
            self.upload_body(body, httpdata_timeout_ms)?;
            self.action_and_read(Method::Post, timeout)
        })
    }

    fn set_url(&self, url: &str) -> Result<()> {
        self.at.command(
            &format!("AT+HTTPPARA=\"URL\",\"{url}\""),
            Duration::from_secs(5),
        )?;
        Ok(())
    }

    /// Custom headers via the USERDATA parameter. Firmware-dependent:
    /// some SIM800 builds ignore it, so nothing here relies on it.
    fn set_headers(&self, headers: &[(&str, &str)]) -> Result<()> {
        if headers.is_empty() {
            return Ok(());
        }
        let blob = headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\\r\\n");
        self.at.command(
            &format!("AT+HTTPPARA=\"USERDATA\",\"{blob}\""),
            Duration::from_secs(5),
        )?;
        Ok(())
    }

    /// Retry `f` on stack-busy; every other failure is final.
    fn with_stack_retry<T>(&self, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Err(e) if e.http_status() == Some(STATUS_STACK_BUSY)
                    && attempt < self.retry_attempts =>
                {
                    warn!(
                        "HTTP stack busy (604), retry {attempt}/{} after {:?}",
                        self.retry_attempts, self.retry_delay
                    );
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Send `AT+HTTPDATA` and push the body after the DOWNLOAD prompt,
    /// atomically under the lock.
    fn upload_body(&self, body: &[u8], httpdata_timeout_ms: u32) -> Result<()> {
        self.at.exclusive(|io| {
            debug!("AT >> AT+HTTPDATA ({} bytes)", body.len());
            io.write_raw(format!("AT+HTTPDATA={},{httpdata_timeout_ms}\r\n", body.len()).as_bytes())?;

            let deadline = Instant::now()
                + Duration::from_millis(u64::from(httpdata_timeout_ms))
                + Duration::from_secs(5);
            let pos = io
                .read_until_contains(b"DOWNLOAD", 0, deadline, "DOWNLOAD prompt")
                .map_err(|e| match e {
                    Error::Timeout(_) => {
                        Error::http("did not receive DOWNLOAD prompt from modem")
                    }
                    other => other,
                })?;
            io.take(pos + b"DOWNLOAD".len());

            io.write_raw(body)?;
            debug!("sent {} bytes of POST data", body.len());

            // Let the modem commit the buffer before it answers.
            thread::sleep(HTTPDATA_SETTLE);

            let resp = io.read_until_terminal(Duration::from_secs(10), None)?;
            raise_if_error("AT+HTTPDATA", &resp)
        })
    }

    /// Fire `AT+HTTPACTION`, wait for its URC, map stack failures, read
    /// the body when one is declared.
    fn action_and_read(&self, method: Method, read_timeout: Duration) -> Result<HttpResponse> {
        self.at.command(
            &format!("AT+HTTPACTION={}", method as u8),
            Duration::from_secs(5),
        )?;

        let line = self
            .at
            .wait_for_urc("+HTTPACTION:", read_timeout)
            .map_err(|e| match e {
                Error::Timeout(_) => Error::http("timeout waiting for +HTTPACTION"),
                other => other,
            })?;

        let (status, length) = parse_action(&line)
            .ok_or_else(|| Error::http(format!("could not parse {line:?}")))?;

        if status >= 600 {
            return Err(stack_error(status));
        }

        if method == Method::Head || length == 0 {
            return Ok(HttpResponse {
                status_code: status,
                body: Vec::new(),
            });
        }

        let body = self.read_body(length)?;
        Ok(HttpResponse {
            status_code: status,
            body,
        })
    }

    /// Binary-safe `AT+HTTPREAD`.
    ///
    /// The modem answers `+HTTPREAD: <len>\r\n<LEN bytes>\r\nOK\r\n`; the
    /// declared byte count is authoritative and the payload may contain
    /// anything, including CRLF and the literal `OK`/`ERROR`. Never
    /// split the payload on newlines.
    fn read_body(&self, expected_length: usize) -> Result<Vec<u8>> {
        if expected_length == 0 {
            return Ok(Vec::new());
        }

        let body_timeout = self.body_timeout;
        self.at.exclusive(|io| {
            io.wake()?;
            debug!("AT >> AT+HTTPREAD ({expected_length} bytes expected)");
            io.write_raw(b"AT+HTTPREAD\r\n")?;

            let deadline = Instant::now() + body_timeout;

            let marker_pos = io
                .read_until_contains(b"+HTTPREAD:", 0, deadline, "+HTTPREAD response")
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::http("did not receive +HTTPREAD response"),
                    other => other,
                })?;
            let header_end = io
                .read_until_contains(b"\r\n", marker_pos, deadline, "+HTTPREAD header")
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::http("malformed +HTTPREAD response"),
                    other => other,
                })?;
            let body_start = header_end + 2;

            if let Err(e) = io.ensure_buffered(body_start + expected_length, deadline, "HTTP body")
            {
                if e.is_timeout() {
                    let got = io.buffered().len().saturating_sub(body_start);
                    return Err(Error::http(format!(
                        "HTTPREAD truncated: got {got} of {expected_length} bytes"
                    )));
                }
                return Err(e);
            }

            io.take(body_start);
            let body = io.take(expected_length);

            // Trailing \r\nOK — best-effort, never block.
            io.drain_pending();

            Ok(body)
        })
    }
}

/// Parse `+HTTPACTION: <method>,<status>,<len>`.
fn parse_action(line: &str) -> Option<(u16, usize)> {
    let rest = line.strip_prefix("+HTTPACTION:")?;
    let mut parts = rest.split(',').map(str::trim);
    let _method: u8 = parts.next()?.parse().ok()?;
    let status = parts.next()?.parse().ok()?;
    let length = parts.next()?.parse().ok()?;
    Some((status, length))
}

/// Map a 600-range stack status to its error.
fn stack_error(status: u16) -> Error {
    let message = match status {
        601 => "network error (601): bearer connection lost or network unreachable".into(),
        602 => "no memory (602): insufficient memory for operation".into(),
        603 => "DNS error (603): cannot resolve hostname".into(),
        604 => "stack busy (604): HTTP stack is occupied".into(),
        606 => "timeout (606): HTTP request timeout".into(),
        other => format!("HTTP stack error ({other})"),
    };
    Error::http_stack(status, message)
}
