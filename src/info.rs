//! Device and network information queries.
//!
//! Information getters return `Ok(None)` when the modem answered but the
//! payload did not parse; transport and modem errors propagate. The
//! [`Info::all`] aggregate flattens every failure to `null` so one dead
//! query does not sink the whole report.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::at::AtChannel;
use crate::error::{Error, Result};
use crate::network::Network;

/// Aggregated device/network information service.
pub struct Info<'a> {
    at: &'a AtChannel,
}

impl<'a> Info<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel) -> Self {
        Self { at }
    }

    fn network(&self) -> Network<'a> {
        Network::new(self.at)
    }

    /// Firmware revision from `AT+CGMR`.
    ///
    /// SIM800 answers `Revision:1418B05SIM800L24`; some builds reply with
    /// the bare revision string instead.
    pub fn firmware(&self) -> Result<Option<String>> {
        let resp = self.at.command("AT+CGMR", Duration::from_secs(3))?;
        for line in &resp.lines {
            if line.contains("Revision") {
                if let Some(rev) = line.split(':').nth(1) {
                    return Ok(Some(rev.trim().to_string()));
                }
            }
        }
        Ok(resp
            .lines
            .iter()
            .find(|l| l.as_str() != "OK" && !l.starts_with('+'))
            .cloned())
    }

    /// SIM state, delegated to [`Network::sim_status`].
    pub fn sim_status(&self) -> Result<Option<String>> {
        self.network().sim_status()
    }

    /// Battery charge level and voltage from `AT+CBC`.
    ///
    /// Response: `+CBC: <charging>,<percent>,<millivolts>`.
    pub fn battery(&self) -> Result<Option<(u8, f64)>> {
        let resp = self.at.command("AT+CBC", Duration::from_secs(3))?;
        for line in &resp.lines {
            let Some(rest) = line.strip_prefix("+CBC:") else {
                continue;
            };
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            if parts.len() >= 3 {
                if let (Ok(percent), Ok(millivolts)) =
                    (parts[1].parse::<u8>(), parts[2].parse::<u32>())
                {
                    return Ok(Some((percent, f64::from(millivolts) / 1000.0)));
                }
            }
        }
        Ok(None)
    }

    /// Cell-tower fix via `AT+CIPGSMLOC=1,1`, as `(latitude, longitude)`.
    ///
    /// Needs an open bearer. The modem reports
    /// `+CIPGSMLOC: <code>,<longitude>,<latitude>,<date>,<time>` and any
    /// non-zero code means no fix.
    pub fn location(&self) -> Result<(f64, f64)> {
        let resp = self.at.command("AT+CIPGSMLOC=1,1", Duration::from_secs(30))?;
        for line in &resp.lines {
            let Some(rest) = line.strip_prefix("+CIPGSMLOC:") else {
                continue;
            };
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            if parts.len() < 3 {
                break;
            }
            let code: u32 = parts[0]
                .parse()
                .map_err(|_| Error::Location(format!("bad CIPGSMLOC status in {line:?}")))?;
            if code != 0 {
                return Err(Error::Location(format!("CIPGSMLOC error code {code}")));
            }
            let longitude: f64 = parts[1]
                .parse()
                .map_err(|_| Error::Location(format!("bad longitude in {line:?}")))?;
            let latitude: f64 = parts[2]
                .parse()
                .map_err(|_| Error::Location(format!("bad latitude in {line:?}")))?;
            return Ok((latitude, longitude));
        }
        Err(Error::Location("no CIPGSMLOC fix in response".into()))
    }

    /// Everything at once, as a JSON map. Unavailable entries are `null`.
    #[must_use]
    pub fn all(&self) -> Value {
        let net = self.network();
        let signal = net.signal().ok();

        let report = json!({
            "imei": net.imei().ok(),
            "iccid": net.iccid().ok(),
            "firmware": self.firmware().ok().flatten(),
            "sim_status": self.sim_status().ok().flatten(),
            "rssi": signal.map(|s| s.rssi),
            "rssi_dbm": signal.and_then(|s| s.dbm()),
            "signal_bars": signal.map(|s| s.bars()),
            "operator": net.operator(),
            "battery": self.battery().ok().flatten().map(|(percent, volts)| {
                json!({ "percent": percent, "voltage_v": volts })
            }),
        });
        debug!("info report: {report}");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::test_channel;

    #[test]
    fn test_firmware_revision_line() {
        let (chan, _) = test_channel(&[b"Revision:1418B05SIM800L24\r\nOK\r\n"]);
        assert_eq!(
            Info::new(&chan).firmware().unwrap().as_deref(),
            Some("1418B05SIM800L24")
        );
    }

    #[test]
    fn test_firmware_bare_line_fallback() {
        let (chan, _) = test_channel(&[b"1418B04SIM800L24\r\nOK\r\n"]);
        assert_eq!(
            Info::new(&chan).firmware().unwrap().as_deref(),
            Some("1418B04SIM800L24")
        );
    }

    #[test]
    fn test_sim_status() {
        let (chan, _) = test_channel(&[b"+CPIN: SIM PIN\r\nOK\r\n"]);
        assert_eq!(
            Info::new(&chan).sim_status().unwrap().as_deref(),
            Some("SIM PIN")
        );
    }

    #[test]
    fn test_battery_parse() {
        let (chan, _) = test_channel(&[b"+CBC: 0,82,4031\r\nOK\r\n"]);
        let (percent, volts) = Info::new(&chan).battery().unwrap().unwrap();
        assert_eq!(percent, 82);
        assert!((volts - 4.031).abs() < 1e-9);
    }

    #[test]
    fn test_battery_unparseable_is_none() {
        let (chan, _) = test_channel(&[b"+CBC: junk\r\nOK\r\n"]);
        assert!(Info::new(&chan).battery().unwrap().is_none());
    }

    #[test]
    fn test_location_fix() {
        let (chan, _) = test_channel(
            &[b"+CIPGSMLOC: 0,-73.561668,45.508888,2026/08/01,12:00:00\r\nOK\r\n"],
        );
        let (lat, lon) = Info::new(&chan).location().unwrap();
        assert!((lat - 45.508888).abs() < 1e-9);
        assert!((lon - -73.561668).abs() < 1e-9);
    }

    #[test]
    fn test_location_error_code() {
        let (chan, _) = test_channel(&[b"+CIPGSMLOC: 404\r\nOK\r\n"]);
        let err = Info::new(&chan).location().unwrap_err();
        assert!(matches!(err, Error::Location(_)));
    }

    #[test]
    fn test_all_reports_nulls_for_failures() {
        // Only CSQ and CGSN answer usefully; everything else errors.
        // The signal is read first, then the queries in report order.
        let (chan, _) = test_channel(&[
            b"+CSQ: 20,0\r\nOK\r\n",      // CSQ
            b"866834049460285\r\nOK\r\n", // CGSN
            b"ERROR\r\n",                 // CCID
            b"ERROR\r\n",                 // CGMR
            b"ERROR\r\n",                 // CPIN?
            b"ERROR\r\n",                 // COPS?
            b"ERROR\r\n",                 // CSPN?
            b"ERROR\r\n",                 // CBC
        ]);
        let report = Info::new(&chan).all();
        assert_eq!(report["imei"], "866834049460285");
        assert_eq!(report["iccid"], Value::Null);
        assert_eq!(report["rssi"], 20);
        assert_eq!(report["rssi_dbm"], -73);
        assert_eq!(report["signal_bars"], 4);
        assert_eq!(report["operator"], Value::Null);
        assert_eq!(report["battery"], Value::Null);
    }
}
