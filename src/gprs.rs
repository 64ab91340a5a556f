//! GPRS bearer lifecycle over `AT+CGATT` / `AT+SAPBR`.
//!
//! The SAPBR bearer is a singleton modem-side resource: it must be up
//! before any IP-level service (HTTP, CIPGSMLOC) can run, and opening it
//! can take the better part of a minute on a congested network.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::at::{AtChannel, CommandOpts};
use crate::error::{Error, Result};

/// Bearer state from `AT+SAPBR=2,<cid>`.
///
/// `status`: 0=connecting, 1=connected, 2=closing, 3=closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BearerStatus {
    pub cid: u8,
    pub status: u8,
    /// Assigned IPv4 address when connected.
    pub ip: Option<String>,
}

impl BearerStatus {
    #[must_use]
    pub fn connected(&self) -> bool {
        self.status == 1
    }
}

/// Bearer management for one PDP context.
pub struct Gprs<'a> {
    at: &'a AtChannel,
    apn: String,
    cid: u8,
    user: Option<String>,
    password: Option<String>,
}

impl<'a> Gprs<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel, apn: impl Into<String>, cid: u8) -> Self {
        Self {
            at,
            apn: apn.into(),
            cid,
            user: None,
            password: None,
        }
    }

    /// APN authentication, for networks that need it.
    #[must_use]
    pub fn with_auth(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    /// Attach to the packet service, polling `AT+CGATT?` once per second
    /// until the modem confirms or the deadline expires.
    pub fn attach(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            match self.attach_once() {
                Ok(true) => {
                    debug!("GPRS attached");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("CGATT poll failed: {e}"),
            }
            thread::sleep(Duration::from_secs(1));
        }

        Err(Error::Gprs("could not attach to GPRS (AT+CGATT=1)".into()))
    }

    fn attach_once(&self) -> Result<bool> {
        self.at.command_with(
            "AT+CGATT=1",
            CommandOpts {
                timeout: Duration::from_secs(5),
                retries: 1,
                ..CommandOpts::default()
            },
        )?;
        let resp = self.at.command("AT+CGATT?", Duration::from_secs(3))?;
        Ok(resp.lines.iter().any(|l| l.contains("+CGATT: 1")))
    }

    /// Configure and open the bearer, returning its queried status.
    /// Opening can take up to 90 s on some networks.
    pub fn open(&self) -> Result<BearerStatus> {
        let cid = self.cid;
        self.at.command(
            &format!("AT+SAPBR=3,{cid},\"Contype\",\"GPRS\""),
            Duration::from_secs(5),
        )?;
        self.at.command(
            &format!("AT+SAPBR=3,{cid},\"APN\",\"{}\"", self.apn),
            Duration::from_secs(5),
        )?;

        if let Some(user) = &self.user {
            self.at.command(
                &format!("AT+SAPBR=3,{cid},\"USER\",\"{user}\""),
                Duration::from_secs(5),
            )?;
        }
        if let Some(password) = &self.password {
            self.at.command(
                &format!("AT+SAPBR=3,{cid},\"PWD\",\"{password}\""),
                Duration::from_secs(5),
            )?;
        }

        self.at.command_with(
            &format!("AT+SAPBR=1,{cid}"),
            CommandOpts {
                timeout: Duration::from_secs(90),
                retries: 1,
                ..CommandOpts::default()
            },
        )?;

        let status = self.query()?;
        debug!("bearer open: {status:?}");
        Ok(status)
    }

    /// Query the bearer status.
    pub fn query(&self) -> Result<BearerStatus> {
        let resp = self
            .at
            .command(&format!("AT+SAPBR=2,{}", self.cid), Duration::from_secs(10))?;

        for line in &resp.lines {
            let Some(rest) = line.strip_prefix("+SAPBR:") else {
                continue;
            };
            // +SAPBR: <cid>,<status>,"<ip>" — the IP field is optional.
            let mut parts = rest.split(',').map(str::trim);
            let cid = parts.next().and_then(|p| p.parse().ok());
            let status = parts.next().and_then(|p| p.parse().ok());
            if let (Some(cid), Some(status)) = (cid, status) {
                let ip = parts
                    .next()
                    .map(|p| p.trim_matches('"'))
                    .filter(|p| !p.is_empty())
                    .map(String::from);
                return Ok(BearerStatus { cid, status, ip });
            }
        }

        Err(Error::Gprs("could not parse SAPBR status".into()))
    }

    /// Close the bearer. Best-effort: never propagates.
    pub fn close(&self) {
        if let Err(e) = self
            .at
            .command(&format!("AT+SAPBR=0,{}", self.cid), Duration::from_secs(20))
        {
            debug!("bearer close (ignored): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::test_channel;

    #[test]
    fn test_attach_first_try() {
        let (chan, _) = test_channel(&[b"OK\r\n", b"+CGATT: 1\r\nOK\r\n"]);
        Gprs::new(&chan, "internet", 1)
            .attach(Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_attach_deadline() {
        let (chan, _) = test_channel(&[b"OK\r\n", b"+CGATT: 0\r\nOK\r\n"]);
        let err = Gprs::new(&chan, "internet", 1)
            .attach(Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::Gprs(_)));
    }

    #[test]
    fn test_open_sends_configuration_in_order() {
        let (chan, state) = test_channel(&[
            b"OK\r\n", // Contype
            b"OK\r\n", // APN
            b"OK\r\n", // SAPBR=1
            b"+SAPBR: 1,1,\"10.54.0.3\"\r\nOK\r\n",
        ]);
        let status = Gprs::new(&chan, "internet", 1).open().unwrap();
        assert!(status.connected());
        assert_eq!(status.ip.as_deref(), Some("10.54.0.3"));

        let written = state.lock().unwrap().written.clone();
        let text = String::from_utf8_lossy(&written).to_string();
        let contype = text.find("AT+SAPBR=3,1,\"Contype\",\"GPRS\"").unwrap();
        let apn = text.find("AT+SAPBR=3,1,\"APN\",\"internet\"").unwrap();
        let open = text.find("AT+SAPBR=1,1").unwrap();
        let query = text.find("AT+SAPBR=2,1").unwrap();
        assert!(contype < apn && apn < open && open < query);
        assert!(!text.contains("\"USER\""));
    }

    #[test]
    fn test_open_with_auth() {
        let (chan, state) = test_channel(&[
            b"OK\r\n",
            b"OK\r\n",
            b"OK\r\n", // USER
            b"OK\r\n", // PWD
            b"OK\r\n",
            b"+SAPBR: 1,1,\"10.0.0.1\"\r\nOK\r\n",
        ]);
        Gprs::new(&chan, "internet", 1)
            .with_auth(Some("u".into()), Some("p".into()))
            .open()
            .unwrap();
        let written = state.lock().unwrap().written.clone();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("AT+SAPBR=3,1,\"USER\",\"u\""));
        assert!(text.contains("AT+SAPBR=3,1,\"PWD\",\"p\""));
    }

    #[test]
    fn test_query_without_ip() {
        let (chan, _) = test_channel(&[b"+SAPBR: 1,3\r\nOK\r\n"]);
        let status = Gprs::new(&chan, "internet", 1).query().unwrap();
        assert_eq!(
            status,
            BearerStatus {
                cid: 1,
                status: 3,
                ip: None
            }
        );
    }

    #[test]
    fn test_close_swallows_errors() {
        let (chan, _) = test_channel(&[b"ERROR\r\n"]);
        Gprs::new(&chan, "internet", 1).close();
    }
}
