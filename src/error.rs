//! Error taxonomy for the driver.
//!
//! Two failure families matter to callers and are kept distinct:
//! [`Error::Timeout`] (no terminator or expected URC within the deadline)
//! and [`Error::At`] (the modem itself answered `ERROR`, `+CME ERROR: n`
//! or `+CMS ERROR: n`). Retry logic only ever applies to the former.
//! HTTP stack statuses 600–606 surface as [`Error::Http`] with the native
//! code; real HTTP responses (1xx–5xx) are values, not errors.

use std::fmt;

use thiserror::Error;

/// Details carried by [`Error::At`].
///
/// `cme_code` / `cms_code` are populated when the response contained a
/// parseable `+CME ERROR:` / `+CMS ERROR:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtErrorDetails {
    /// The command that was sent, without trailing CRLF.
    pub command: String,
    /// Full response text (lines joined with `\n`).
    pub response: String,
    /// Mobile-equipment error code, if reported.
    pub cme_code: Option<u16>,
    /// Message-service error code, if reported.
    pub cms_code: Option<u16>,
}

impl fmt::Display for AtErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.command, self.response)?;
        if let Some(cme) = self.cme_code {
            write!(f, " (CME {cme})")?;
        }
        if let Some(cms) = self.cms_code {
            write!(f, " (CMS {cms})")?;
        }
        Ok(())
    }
}

/// All errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Deadline expired before a terminator or expected URC arrived.
    #[error("AT timeout: {0}")]
    Timeout(String),

    /// The modem reported an error for a command.
    #[error("AT command failed: {0}")]
    At(AtErrorDetails),

    /// Serial port or lockfile I/O failure.
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Registration refused or timed out; identity reads failed.
    #[error("network: {0}")]
    Network(String),

    /// GPRS attach or bearer configure/open failure.
    #[error("GPRS: {0}")]
    Gprs(String),

    /// HTTP stack failure. `status` holds the SIM800 stack code (600–606)
    /// when the failure was reported through `+HTTPACTION`.
    #[error("HTTP: {message}")]
    Http {
        message: String,
        status: Option<u16>,
    },

    /// SMS send handshake or service failure.
    #[error("SMS: {0}")]
    Sms(String),

    /// CIPGSMLOC returned a non-zero status or no fix.
    #[error("location: {0}")]
    Location(String),

    /// Invalid CFUN/CSCLK argument.
    #[error("power: {0}")]
    Power(String),
}

impl Error {
    /// True for the timeout class, which is the only retriable one at the
    /// AT-channel level.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// The SIM800 HTTP stack status (600–606), when present.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => *status,
            _ => None,
        }
    }

    pub(crate) fn http(message: impl Into<String>) -> Self {
        Error::Http {
            message: message.into(),
            status: None,
        }
    }

    pub(crate) fn http_stack(status: u16, message: impl Into<String>) -> Self {
        Error::Http {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
