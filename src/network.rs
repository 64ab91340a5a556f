//! Network registration, identity and signal queries.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::at::{AtChannel, CommandOpts};
use crate::error::{Error, Result};

/// Signal quality from `AT+CSQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalQuality {
    /// Received signal strength indicator, 0..31 or 99 for unknown.
    pub rssi: u8,
    /// Bit error rate, 0..7 or 99 for unknown.
    pub ber: u8,
}

impl SignalQuality {
    /// Approximate strength in dBm: `-113 + 2·RSSI`. `None` when unknown.
    #[must_use]
    pub fn dbm(&self) -> Option<i16> {
        if self.rssi == 99 {
            return None;
        }
        Some(-113 + 2 * i16::from(self.rssi))
    }

    /// Strength as 0–5 "bars"; 0 when the modem reports no signal.
    #[must_use]
    pub fn bars(&self) -> u8 {
        match self.rssi {
            99 => 0,
            r if r < 2 => 0,
            r if r < 10 => 1,
            r if r < 15 => 2,
            r if r < 20 => 3,
            r if r < 25 => 4,
            _ => 5,
        }
    }
}

/// Network-level queries over an AT channel.
pub struct Network<'a> {
    at: &'a AtChannel,
}

impl<'a> Network<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel) -> Self {
        Self { at }
    }

    /// Module IMEI. Tries `AT+CGSN`, then `AT+GSN`; accepts the first
    /// digit-only line of plausible length.
    pub fn imei(&self) -> Result<String> {
        for cmd in ["AT+CGSN", "AT+GSN"] {
            let Ok(resp) = self.at.command(cmd, Duration::from_secs(3)) else {
                continue;
            };
            for line in &resp.lines {
                if line.len() >= 14 && line.bytes().all(|b| b.is_ascii_digit()) {
                    return Ok(line.clone());
                }
            }
        }
        Err(Error::Network("could not read IMEI".into()))
    }

    /// SIM ICCID from `AT+CCID`.
    pub fn iccid(&self) -> Result<String> {
        let resp = self.at.command("AT+CCID", Duration::from_secs(3))?;
        for line in &resp.lines {
            if let Some(rest) = line.strip_prefix("+CCID") {
                let id = rest.trim_start_matches(':').trim().trim_matches('"');
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        Err(Error::Network("could not read ICCID".into()))
    }

    /// True when `AT+CPIN?` reports READY. Failures count as not ready.
    #[must_use]
    pub fn sim_ready(&self) -> bool {
        match self.at.command("AT+CPIN?", Duration::from_secs(3)) {
            Ok(resp) => resp.lines.iter().any(|l| l.contains("READY")),
            Err(_) => false,
        }
    }

    /// SIM state from `AT+CPIN?`: `READY`, `SIM PIN`, `SIM PUK`, ...
    /// `Ok(None)` when the modem answered without a `+CPIN:` line.
    pub fn sim_status(&self) -> Result<Option<String>> {
        let resp = self.at.command("AT+CPIN?", Duration::from_secs(3))?;
        for line in &resp.lines {
            if let Some(status) = line.strip_prefix("+CPIN:") {
                return Ok(Some(status.trim().to_string()));
            }
        }
        Ok(None)
    }

    /// Current signal quality from `AT+CSQ`.
    pub fn signal(&self) -> Result<SignalQuality> {
        let resp = self.at.command("AT+CSQ", Duration::from_secs(3))?;
        for line in &resp.lines {
            let Some(rest) = line.strip_prefix("+CSQ:") else {
                continue;
            };
            let mut parts = rest.split(',').map(str::trim);
            if let (Some(rssi), Some(ber)) = (parts.next(), parts.next()) {
                if let (Ok(rssi), Ok(ber)) = (rssi.parse(), ber.parse()) {
                    return Ok(SignalQuality { rssi, ber });
                }
            }
        }
        Err(Error::Network("could not parse CSQ response".into()))
    }

    /// Operator name from `AT+COPS?`, falling back to `AT+CSPN?`.
    #[must_use]
    pub fn operator(&self) -> Option<String> {
        for (cmd, tag) in [("AT+COPS?", "+COPS:"), ("AT+CSPN?", "+CSPN:")] {
            let Ok(resp) = self.at.command(cmd, Duration::from_secs(5)) else {
                continue;
            };
            for line in &resp.lines {
                if line.starts_with(tag) {
                    if let Some(name) = first_quoted(line) {
                        return Some(name.to_string());
                    }
                }
            }
        }
        None
    }

    /// Poll `AT+CREG?` (or `AT+CGREG?` when `gprs`) once per second until
    /// the modem reports home (1) or roaming (5) registration.
    pub fn wait_registered(&self, timeout: Duration, gprs: bool) -> Result<()> {
        let cmd = if gprs { "AT+CGREG?" } else { "AT+CREG?" };
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if let Ok(resp) = self.at.command_with(
                cmd,
                CommandOpts {
                    timeout: Duration::from_secs(3),
                    retries: 1,
                    ..CommandOpts::default()
                },
            ) {
                for line in &resp.lines {
                    if !line.starts_with("+CREG:") && !line.starts_with("+CGREG:") {
                        continue;
                    }
                    if let Some(stat) = registration_status(line) {
                        if stat == 1 || stat == 5 {
                            debug!("registered ({cmd} -> {stat})");
                            return Ok(());
                        }
                    }
                }
            }
            thread::sleep(Duration::from_secs(1));
        }

        Err(Error::Network(format!(
            "not registered on network (cmd={cmd}) within {}s",
            timeout.as_secs()
        )))
    }
}

/// Last integer field of a `+CREG: n,stat` / `+CREG: stat` line.
fn registration_status(line: &str) -> Option<u8> {
    line.rsplit(|c| c == ':' || c == ',')
        .find(|p| !p.trim().is_empty())
        .and_then(|p| p.trim().parse().ok())
}

/// First double-quoted substring of a line.
pub(crate) fn first_quoted(line: &str) -> Option<&str> {
    let start = line.find('"')? + 1;
    let end = line[start..].find('"')? + start;
    Some(&line[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::test_channel;

    #[test]
    fn test_bars_mapping_table() {
        let cases = [
            (0, 0),
            (1, 0),
            (2, 1),
            (9, 1),
            (10, 2),
            (14, 2),
            (15, 3),
            (19, 3),
            (20, 4),
            (24, 4),
            (25, 5),
            (31, 5),
            (99, 0),
        ];
        for (rssi, bars) in cases {
            let q = SignalQuality { rssi, ber: 0 };
            assert_eq!(q.bars(), bars, "rssi={rssi}");
        }
    }

    #[test]
    fn test_bars_exhaustive_range_is_monotonic() {
        let mut last = 0;
        for rssi in 0..=31 {
            let bars = SignalQuality { rssi, ber: 0 }.bars();
            assert!(bars >= last);
            last = bars;
        }
    }

    #[test]
    fn test_dbm_estimate() {
        assert_eq!(SignalQuality { rssi: 0, ber: 0 }.dbm(), Some(-113));
        assert_eq!(SignalQuality { rssi: 15, ber: 0 }.dbm(), Some(-83));
        assert_eq!(SignalQuality { rssi: 31, ber: 0 }.dbm(), Some(-51));
        assert_eq!(SignalQuality { rssi: 99, ber: 99 }.dbm(), None);
    }

    #[test]
    fn test_signal_parse() {
        let (chan, _) = test_channel(&[b"+CSQ: 15,99\r\nOK\r\n"]);
        let q = Network::new(&chan).signal().unwrap();
        assert_eq!(q, SignalQuality { rssi: 15, ber: 99 });
    }

    #[test]
    fn test_imei_via_cgsn() {
        let (chan, _) = test_channel(&[b"866834049460285\r\nOK\r\n"]);
        assert_eq!(Network::new(&chan).imei().unwrap(), "866834049460285");
    }

    #[test]
    fn test_imei_falls_back_to_gsn() {
        // CGSN errors out, GSN answers.
        let (chan, state) = test_channel(&[b"ERROR\r\n", b"866834049460285\r\nOK\r\n"]);
        assert_eq!(Network::new(&chan).imei().unwrap(), "866834049460285");
        let written = state.lock().unwrap().written.clone();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("AT+CGSN\r\n"));
        assert!(text.contains("AT+GSN\r\n"));
    }

    #[test]
    fn test_iccid_parse() {
        let (chan, _) = test_channel(&[b"+CCID: \"89860318760238610932\"\r\nOK\r\n"]);
        assert_eq!(
            Network::new(&chan).iccid().unwrap(),
            "89860318760238610932"
        );
    }

    #[test]
    fn test_sim_ready() {
        let (chan, _) = test_channel(&[b"+CPIN: READY\r\nOK\r\n"]);
        assert!(Network::new(&chan).sim_ready());

        let (chan, _) = test_channel(&[b"+CME ERROR: 10\r\n"]);
        assert!(!Network::new(&chan).sim_ready());
    }

    #[test]
    fn test_sim_status_value() {
        let (chan, _) = test_channel(&[b"+CPIN: SIM PIN\r\nOK\r\n"]);
        assert_eq!(
            Network::new(&chan).sim_status().unwrap().as_deref(),
            Some("SIM PIN")
        );

        let (chan, _) = test_channel(&[b"OK\r\n"]);
        assert!(Network::new(&chan).sim_status().unwrap().is_none());
    }

    #[test]
    fn test_operator_from_cops() {
        let (chan, _) = test_channel(&[b"+COPS: 0,0,\"Vodafone\",2\r\nOK\r\n"]);
        assert_eq!(Network::new(&chan).operator().as_deref(), Some("Vodafone"));
    }

    #[test]
    fn test_operator_falls_back_to_cspn() {
        let (chan, _) = test_channel(&[b"ERROR\r\n", b"+CSPN: \"TELE2\",0\r\nOK\r\n"]);
        assert_eq!(Network::new(&chan).operator().as_deref(), Some("TELE2"));
    }

    #[test]
    fn test_registration_status_field() {
        assert_eq!(registration_status("+CREG: 0,1"), Some(1));
        assert_eq!(registration_status("+CGREG: 0,5"), Some(5));
        assert_eq!(registration_status("+CREG: 2"), Some(2));
        assert_eq!(registration_status("+CREG: junk"), None);
    }

    #[test]
    fn test_wait_registered_home() {
        let (chan, state) = test_channel(&[b"+CREG: 0,1\r\nOK\r\n"]);
        Network::new(&chan)
            .wait_registered(Duration::from_secs(5), false)
            .unwrap();
        let written = state.lock().unwrap().written.clone();
        assert!(String::from_utf8_lossy(&written).contains("AT+CREG?\r\n"));
    }

    #[test]
    fn test_wait_registered_gprs_uses_cgreg() {
        let (chan, state) = test_channel(&[b"+CGREG: 0,5\r\nOK\r\n"]);
        Network::new(&chan)
            .wait_registered(Duration::from_secs(5), true)
            .unwrap();
        let written = state.lock().unwrap().written.clone();
        assert!(String::from_utf8_lossy(&written).contains("AT+CGREG?\r\n"));
    }

    #[test]
    fn test_wait_registered_deadline() {
        let (chan, _) = test_channel(&[b"+CREG: 0,0\r\nOK\r\n"]);
        let err = Network::new(&chan)
            .wait_registered(Duration::from_millis(50), false)
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
