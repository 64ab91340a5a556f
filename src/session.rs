//! Scoped modem session: bring the stack up, run user work, tear down.
//!
//! Establishing walks the full ladder — AT sync, stale-state cleanup,
//! SIM check, network registration, GPRS attach, bearer open, HTTP init —
//! and hands back a [`Session`] whose `Drop` always runs the teardown,
//! whether the body finished, returned early with `?`, or panicked.
//! After a failed or interrupted session the next establish starts from
//! the same best-effort cleanup, so no manual reset is needed.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::at::{AtChannel, CommandOpts};
use crate::error::{Error, Result};
use crate::gprs::{BearerStatus, Gprs};
use crate::http::{Http, HttpResponse};
use crate::info::Info;
use crate::network::Network;
use crate::sms::{Sms, SmsMessage};

/// Default deadline for an HTTP request inside a session.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
/// Default `AT+HTTPDATA` window for POST uploads.
const HTTPDATA_TIMEOUT_MS: u32 = 10_000;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// GPRS access point name. Required.
    pub apn: String,
    /// PDP context id (1–3 on SIM800).
    pub cid: u8,
    /// APN username, for networks that need it.
    pub user: Option<String>,
    /// APN password.
    pub password: Option<String>,
    /// Leave the bearer up on exit, for back-to-back sessions.
    pub keep_bearer_open: bool,
    /// Also issue `AT+CIPSHUT` and `AT+CFUN=0` on exit — the legacy hard
    /// teardown. Off by default.
    pub full_teardown: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn new(apn: impl Into<String>) -> Self {
        Self {
            apn: apn.into(),
            cid: 1,
            user: None,
            password: None,
            keep_bearer_open: false,
            full_teardown: false,
        }
    }
}

/// An established modem session. Dropping it tears the stack down.
pub struct Session<'a> {
    at: &'a AtChannel,
    config: SessionConfig,
    bearer: BearerStatus,
}

impl<'a> std::fmt::Debug for Session<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("bearer", &self.bearer)
            .finish()
    }
}

impl<'a> Session<'a> {
    /// Walk the bring-up ladder. On any failure the partial state is
    /// cleaned up best-effort before the error propagates.
    pub fn establish(at: &'a AtChannel, config: SessionConfig) -> Result<Self> {
        match Self::enter(at, &config) {
            Ok(bearer) => {
                info!(
                    "session up: apn={} cid={} ip={}",
                    config.apn,
                    config.cid,
                    bearer.ip.as_deref().unwrap_or("-")
                );
                Ok(Self { at, config, bearer })
            }
            Err(e) => {
                warn!("session bring-up failed: {e}");
                Http::new(at, config.cid).term();
                Gprs::new(at, &config.apn, config.cid).close();
                Err(e)
            }
        }
    }

    fn enter(at: &AtChannel, config: &SessionConfig) -> Result<BearerStatus> {
        at.sync()?;

        // A previous crash may have left the HTTP service or bearer up.
        Http::new(at, config.cid).term();
        Gprs::new(at, &config.apn, config.cid).close();

        let network = Network::new(at);
        if !network.sim_ready() {
            return Err(Error::Network("SIM card not ready".into()));
        }
        network.wait_registered(REGISTRATION_TIMEOUT, false)?;

        let gprs = Gprs::new(at, &config.apn, config.cid)
            .with_auth(config.user.clone(), config.password.clone());
        gprs.attach(ATTACH_TIMEOUT)?;
        network.wait_registered(REGISTRATION_TIMEOUT, true)?;

        let bearer = gprs.open()?;
        Http::new(at, config.cid).init()?;
        Ok(bearer)
    }

    /// Bearer state captured at open time.
    #[must_use]
    pub fn bearer(&self) -> &BearerStatus {
        &self.bearer
    }

    /// HTTP client bound to this session's context.
    #[must_use]
    pub fn http(&self) -> Http<'a> {
        Http::new(self.at, self.config.cid)
    }

    /// SMS service.
    #[must_use]
    pub fn sms(&self) -> Sms<'a> {
        Sms::new(self.at)
    }

    /// GET with default timeout and no extra headers.
    pub fn http_get(&self, url: &str) -> Result<HttpResponse> {
        self.http().get(url, &[], HTTP_TIMEOUT)
    }

    /// GET with custom headers and deadline.
    pub fn http_get_with(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.http().get(url, headers, timeout)
    }

    /// POST with default content type, upload window and deadline.
    pub fn http_post(&self, url: &str, body: &[u8]) -> Result<HttpResponse> {
        self.http()
            .post(url, body, "application/json", &[], HTTPDATA_TIMEOUT_MS, HTTP_TIMEOUT)
    }

    /// POST with everything explicit.
    pub fn http_post_with(
        &self,
        url: &str,
        body: &[u8],
        content_type: &str,
        headers: &[(&str, &str)],
        httpdata_timeout_ms: u32,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.http()
            .post(url, body, content_type, headers, httpdata_timeout_ms, timeout)
    }

    /// Fire-and-forget SMS send.
    #[must_use]
    pub fn sms_send(&self, number: &str, text: &str) -> bool {
        self.sms().send(number, text)
    }

    /// All stored messages keyed by index.
    #[must_use]
    pub fn sms_read_all(&self) -> BTreeMap<u32, SmsMessage> {
        self.sms().read_all()
    }

    /// Cell-tower location; the session's open bearer satisfies the
    /// CIPGSMLOC requirement.
    pub fn location(&self) -> Result<(f64, f64)> {
        Info::new(self.at).location()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        debug!("session teardown (keep_bearer_open={})", self.config.keep_bearer_open);
        Http::new(self.at, self.config.cid).term();
        if !self.config.keep_bearer_open {
            Gprs::new(self.at, &self.config.apn, self.config.cid).close();
        }
        if self.config.full_teardown {
            // CIPSHUT answers `SHUT OK` on some firmwares, which is not a
            // bare terminator — keep its wait short.
            let _ = self.at.command_with(
                "AT+CIPSHUT",
                CommandOpts {
                    timeout: Duration::from_secs(2),
                    expect_ok: false,
                    ..CommandOpts::default()
                },
            );
            let _ = self.at.command_with(
                "AT+CFUN=0",
                CommandOpts {
                    timeout: Duration::from_secs(10),
                    expect_ok: false,
                    ..CommandOpts::default()
                },
            );
        }
    }
}
