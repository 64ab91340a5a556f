//! Device facade: owns the AT channel, hands out component views.
//!
//! Every component ([`Network`], [`Gprs`], [`Http`], [`Sms`], [`Info`],
//! [`Power`]) is a thin borrow of the channel, constructed on demand;
//! the serial handle and locks live in one place.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::at::AtChannel;
use crate::config::ModemConfig;
use crate::error::Result;
use crate::gprs::Gprs;
use crate::http::Http;
use crate::info::Info;
use crate::network::Network;
use crate::power::Power;
use crate::session::{Session, SessionConfig};
use crate::sms::Sms;
use crate::transport::TtyPort;

/// A SIM800 modem on a serial port.
pub struct Device {
    at: AtChannel,
    gprs_defaults: crate::config::GprsConfig,
}

impl Device {
    /// Open the modem on `path` at `baudrate`, guarding serial access
    /// with `lockfile` (pass `None` to disable the inter-process layer).
    pub fn open(path: &str, baudrate: u32, lockfile: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            at: AtChannel::open(path, baudrate, lockfile)?,
            gprs_defaults: crate::config::GprsConfig::default(),
        })
    }

    /// Open from a full [`ModemConfig`], carrying its GPRS defaults into
    /// [`Device::session_for`].
    pub fn from_config(config: &ModemConfig) -> Result<Self> {
        let port = TtyPort::open_with_timeout(
            &config.serial.path,
            config.serial.baudrate,
            Duration::from_millis(config.serial.read_timeout_ms),
        )?;
        Ok(Self {
            at: AtChannel::new(Box::new(port), config.lock.lockfile()),
            gprs_defaults: config.gprs.clone(),
        })
    }

    /// The underlying AT channel, for direct command access.
    #[must_use]
    pub fn at(&self) -> &AtChannel {
        &self.at
    }

    #[must_use]
    pub fn network(&self) -> Network<'_> {
        Network::new(&self.at)
    }

    #[must_use]
    pub fn gprs(&self, apn: &str, cid: u8) -> Gprs<'_> {
        Gprs::new(&self.at, apn, cid)
    }

    #[must_use]
    pub fn http(&self, cid: u8) -> Http<'_> {
        Http::new(&self.at, cid)
    }

    #[must_use]
    pub fn sms(&self) -> Sms<'_> {
        Sms::new(&self.at)
    }

    #[must_use]
    pub fn info(&self) -> Info<'_> {
        Info::new(&self.at)
    }

    #[must_use]
    pub fn power(&self) -> Power<'_> {
        Power::new(&self.at)
    }

    /// Establish a session with explicit parameters.
    pub fn session(&self, config: SessionConfig) -> Result<Session<'_>> {
        Session::establish(&self.at, config)
    }

    /// Establish a session for `apn`, filling the rest from the device's
    /// configured GPRS defaults.
    pub fn session_for(&self, apn: &str) -> Result<Session<'_>> {
        let mut config = SessionConfig::new(apn);
        config.cid = self.gprs_defaults.cid;
        config.user = self.gprs_defaults.user.clone();
        config.password = self.gprs_defaults.password.clone();
        config.keep_bearer_open = self.gprs_defaults.keep_bearer_open;
        self.session(config)
    }

    /// All device/network information as a JSON map.
    #[must_use]
    pub fn info_all(&self) -> Value {
        self.info().all()
    }

    /// Close the serial port.
    pub fn close(self) {
        drop(self);
    }
}
