//! AT command channel.
//!
//! Owns the serial port and enforces the access discipline every higher
//! layer relies on: one in-process `Mutex` plus the inter-process
//! [`LockFile`], line framing, command echo filtering, terminator
//! detection, CME/CMS error parsing, URC waits, and the wake-char dance
//! needed when the modem auto-sleeps (`AT+CSCLK=2`).
//!
//! Multi-step handshakes (HTTPREAD, HTTPDATA, CMGS) run inside a single
//! [`AtChannel::exclusive`] section so URCs and other commands cannot
//! interleave with a binary body or a prompt wait. The closure receives
//! `&mut ChannelIo` and calls its methods directly — there is no nested
//! lock acquisition anywhere, so the no-deadlock guarantee holds by
//! construction.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AtErrorDetails, Error, Result};
use crate::lock::LockFile;
use crate::transport::{SerialPort, TtyPort};

/// Wake char written before a command when the modem may be asleep.
const WAKE_CHAR: &[u8] = b"\r";
/// Wake settle delay; the SIM800 datasheet asks for >= 100 ms.
const WAKE_DELAY: Duration = Duration::from_millis(150);
/// Idle backoff between polls of a quiet port.
const POLL_IDLE: Duration = Duration::from_millis(10);
/// Read granularity; anything larger arrives over several passes.
const READ_BUF_SIZE: usize = 1024;

/// Parsed AT command response.
///
/// `lines` holds the trimmed reply lines without echo; the last one is
/// always a terminator (`OK`, `ERROR`, or a `+CME`/`+CMS` error form).
/// `raw` is the undecoded byte stream the lines were framed from.
#[derive(Debug, Clone)]
pub struct AtResponse {
    pub lines: Vec<String>,
    pub raw: Vec<u8>,
}

impl AtResponse {
    /// Response as text, lines joined with `\n`.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Per-command options for [`AtChannel::command_with`].
#[derive(Debug, Clone, Copy)]
pub struct CommandOpts {
    /// Deadline for the terminator.
    pub timeout: Duration,
    /// Raise [`Error::At`] on an error terminator.
    pub expect_ok: bool,
    /// Write the wake char and sleep before the command bytes.
    pub wake: bool,
    /// Extra attempts on *timeout* (never on modem-reported errors).
    pub retries: u32,
}

impl Default for CommandOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            expect_ok: true,
            wake: true,
            retries: 0,
        }
    }
}

impl CommandOpts {
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Locked I/O state: the port plus the receive buffer that carries
/// leftover bytes between framed reads.
pub struct ChannelIo {
    port: Box<dyn SerialPort>,
    rx: Vec<u8>,
    wake_delay: Duration,
}

impl ChannelIo {
    fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            rx: Vec::new(),
            wake_delay: WAKE_DELAY,
        }
    }

    /// Write raw bytes to the port.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    /// Wake a possibly auto-sleeping modem: one CR, then settle.
    pub fn wake(&mut self) -> Result<()> {
        self.write_raw(WAKE_CHAR)?;
        thread::sleep(self.wake_delay);
        Ok(())
    }

    /// One read pass into the receive buffer. Sleeps briefly when the
    /// port is idle so deadline loops do not spin.
    fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_BUF_SIZE];
        let n = self.port.read_chunk(&mut buf)?;
        if n == 0 {
            thread::sleep(POLL_IDLE);
        } else {
            self.rx.extend_from_slice(&buf[..n]);
        }
        Ok(())
    }

    /// Next raw line, up to and including `\n`.
    fn read_line_raw(&mut self, deadline: Instant, what: &str) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == b'\n') {
                return Ok(self.rx.drain(..=pos).collect());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            self.fill()?;
        }
    }

    /// Read trimmed lines until a terminator (`OK`, or anything containing
    /// `ERROR`) or the deadline. Filters the command echo once when
    /// `echo_of` is given.
    pub fn read_until_terminal(
        &mut self,
        timeout: Duration,
        echo_of: Option<&str>,
    ) -> Result<AtResponse> {
        let deadline = Instant::now() + timeout;
        let mut raw = Vec::new();
        let mut lines = Vec::new();
        let mut echo_filtered = false;

        loop {
            let line_raw = self.read_line_raw(deadline, "waiting for OK/ERROR")?;
            raw.extend_from_slice(&line_raw);

            let line = String::from_utf8_lossy(&line_raw).trim().to_string();
            if line.is_empty() {
                continue;
            }

            // Echo can be the full command or the command without its AT
            // prefix, depending on firmware.
            if !echo_filtered {
                if let Some(cmd) = echo_of {
                    let bare = cmd.strip_prefix("AT").unwrap_or(cmd).trim();
                    if line == cmd || line == bare {
                        echo_filtered = true;
                        continue;
                    }
                }
            }

            let terminal = line == "OK" || line.contains("ERROR");
            lines.push(line);
            if terminal {
                return Ok(AtResponse { lines, raw });
            }
        }
    }

    /// Poll line-by-line for the next line starting with `prefix`.
    pub fn wait_for_urc(&mut self, prefix: &str, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let line_raw = self.read_line_raw(deadline, &format!("URC {prefix}"))?;
            let line = String::from_utf8_lossy(&line_raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line.starts_with(prefix) {
                debug!("URC << {line}");
                return Ok(line);
            }
        }
    }

    /// Buffer until `pattern` appears at or after `from`; returns its
    /// start offset. The matched bytes stay in the buffer.
    pub fn read_until_contains(
        &mut self,
        pattern: &[u8],
        from: usize,
        deadline: Instant,
        what: &str,
    ) -> Result<usize> {
        loop {
            if self.rx.len() >= from + pattern.len() {
                if let Some(pos) = find(&self.rx[from..], pattern) {
                    return Ok(from + pos);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            self.fill()?;
        }
    }

    /// Buffer until at least `n` bytes are available.
    pub fn ensure_buffered(&mut self, n: usize, deadline: Instant, what: &str) -> Result<()> {
        while self.rx.len() < n {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            self.fill()?;
        }
        Ok(())
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.rx
    }

    /// Remove and return up to `n` buffered bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.rx.len());
        self.rx.drain(..n).collect()
    }

    /// Best-effort drain of whatever is pending; never blocks past one
    /// read pass and never fails.
    pub fn drain_pending(&mut self) {
        self.rx.clear();
        let mut buf = [0u8; READ_BUF_SIZE];
        let _ = self.port.read_chunk(&mut buf);
    }

    /// Discard the receive buffer and the OS input queue.
    pub fn flush_input(&mut self) -> Result<()> {
        self.rx.clear();
        self.port.flush_input()?;
        Ok(())
    }

    /// One command attempt: optional wake, write `cmd + CRLF`, read to a
    /// terminator. Error classification happens in the caller.
    fn send_once(&mut self, cmd: &str, opts: &CommandOpts) -> Result<AtResponse> {
        if opts.wake {
            self.wake()?;
        }
        debug!("AT >> {cmd}");
        self.write_raw(format!("{cmd}\r\n").as_bytes())?;
        self.read_until_terminal(opts.timeout, Some(cmd))
    }
}

/// Serialized AT command channel over a serial port.
pub struct AtChannel {
    io: Mutex<ChannelIo>,
    lock: LockFile,
}

impl AtChannel {
    /// Channel over an already-open port.
    #[must_use]
    pub fn new(port: Box<dyn SerialPort>, lockfile: Option<PathBuf>) -> Self {
        Self {
            io: Mutex::new(ChannelIo::new(port)),
            lock: LockFile::new(lockfile),
        }
    }

    /// Open a serial device and build a channel on it.
    pub fn open(path: &str, baudrate: u32, lockfile: Option<PathBuf>) -> Result<Self> {
        let port = TtyPort::open(path, baudrate)?;
        Ok(Self::new(Box::new(port), lockfile))
    }

    /// Override the wake settle delay (tests set this to zero).
    pub fn set_wake_delay(&self, delay: Duration) {
        self.exclusive_infallible(|io| io.wake_delay = delay);
    }

    /// Run `f` with both lock layers held. All serial bytes in either
    /// direction move inside such a section.
    pub fn exclusive<T>(&self, f: impl FnOnce(&mut ChannelIo) -> Result<T>) -> Result<T> {
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let _flock = self.lock.acquire();
        f(&mut io)
    }

    fn exclusive_infallible<T>(&self, f: impl FnOnce(&mut ChannelIo) -> T) -> T {
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let _flock = self.lock.acquire();
        f(&mut io)
    }

    /// Send an AT command and wait for `OK`/`ERROR` with default options.
    pub fn command(&self, cmd: &str, timeout: Duration) -> Result<AtResponse> {
        self.command_with(cmd, CommandOpts::timeout(timeout))
    }

    /// Send an AT command with full control over expectation, wake and
    /// retry behavior. Retries apply to timeouts only; a modem-reported
    /// error is final.
    pub fn command_with(&self, cmd: &str, opts: CommandOpts) -> Result<AtResponse> {
        let cmd = cmd.trim();
        let mut attempt = 0;
        loop {
            match self.exclusive(|io| io.send_once(cmd, &opts)) {
                Ok(resp) => {
                    debug!("AT << {}", resp.text());
                    if opts.expect_ok {
                        raise_if_error(cmd, &resp)?;
                    }
                    return Ok(resp);
                }
                Err(e) if e.is_timeout() && attempt < opts.retries => {
                    attempt += 1;
                    warn!("retry {attempt}/{} for {cmd}", opts.retries);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the next URC line starting with `prefix`. Holds the lock
    /// for the whole wait so the line cannot be consumed elsewhere.
    pub fn wait_for_urc(&self, prefix: &str, timeout: Duration) -> Result<String> {
        self.exclusive(|io| io.wait_for_urc(prefix, timeout))
    }

    /// Low-level escape hatch used by the HTTP body upload and the SMS
    /// send handshake.
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.exclusive(|io| io.write_raw(data))
    }

    /// Discard anything currently pending on the receive side.
    pub fn flush_input(&self) -> Result<()> {
        self.exclusive(ChannelIo::flush_input)
    }

    /// Synchronize with the modem: probe with `AT` (two retries), disable
    /// echo, enable verbose CME errors.
    pub fn sync(&self) -> Result<()> {
        self.command_with(
            "AT",
            CommandOpts {
                timeout: Duration::from_secs(2),
                retries: 2,
                ..CommandOpts::default()
            },
        )?;
        self.command("ATE0", Duration::from_secs(2))?;
        self.command("AT+CMEE=2", Duration::from_secs(2))?;
        Ok(())
    }
}

/// Classify an already-terminated response, raising [`Error::At`] with
/// CME/CMS codes for the error forms.
pub(crate) fn raise_if_error(cmd: &str, resp: &AtResponse) -> Result<()> {
    let is_error = resp.lines.iter().any(|l| {
        l == "ERROR" || l.starts_with("+CME ERROR") || l.starts_with("+CMS ERROR")
    });
    if !is_error {
        return Ok(());
    }

    let text = resp.text();
    Err(Error::At(AtErrorDetails {
        command: cmd.to_string(),
        cme_code: error_code(&text, "+CME ERROR:"),
        cms_code: error_code(&text, "+CMS ERROR:"),
        response: text,
    }))
}

/// Extract the numeric code following `tag` (e.g. `+CME ERROR:`), skipping
/// whitespace, as in `+CME ERROR: 10`.
fn error_code(text: &str, tag: &str) -> Option<u16> {
    let rest = &text[text.find(tag)? + tag.len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
pub(crate) fn test_channel(chunks: &[&[u8]]) -> (
    AtChannel,
    std::sync::Arc<Mutex<crate::transport::mock::MockState>>,
) {
    let (port, state) = crate::transport::mock::MockPort::scripted(chunks);
    let chan = AtChannel::new(Box::new(port), None);
    chan.set_wake_delay(Duration::ZERO);
    (chan, state)
}
