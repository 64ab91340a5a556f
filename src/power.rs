//! Power and sleep management: `AT+CFUN`, `AT+CSCLK`, `AT+CPOWD`.

use std::time::Duration;

use tracing::debug;

use crate::at::{AtChannel, CommandOpts};
use crate::error::{Error, Result};

/// Power service over an AT channel.
pub struct Power<'a> {
    at: &'a AtChannel,
}

impl<'a> Power<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel) -> Self {
        Self { at }
    }

    /// Set functionality mode: 0 = minimum (RF off), 1 = full,
    /// 4 = disable transmit/receive.
    pub fn set_functionality(&self, fun: u8) -> Result<()> {
        if !matches!(fun, 0 | 1 | 4) {
            return Err(Error::Power(format!("CFUN mode {fun} not supported")));
        }
        self.at
            .command(&format!("AT+CFUN={fun}"), Duration::from_secs(10))?;
        Ok(())
    }

    /// Set sleep mode: 0 = disabled, 1 = DTR-controlled, 2 = automatic
    /// (woken by the channel's wake char).
    pub fn set_sleep(&self, mode: u8) -> Result<()> {
        if mode > 2 {
            return Err(Error::Power("CSCLK mode must be 0, 1 or 2".into()));
        }
        self.at
            .command(&format!("AT+CSCLK={mode}"), Duration::from_secs(5))?;
        Ok(())
    }

    /// Automatic sleep (CSCLK=2); the channel wakes the modem before each
    /// command.
    pub fn enable_auto_sleep(&self) -> Result<()> {
        self.set_sleep(2)
    }

    /// Disable sleep (CSCLK=0).
    pub fn disable_sleep(&self) -> Result<()> {
        self.set_sleep(0)
    }

    /// Minimum functionality: RF off, module still responsive.
    pub fn minimum_functionality(&self) -> Result<()> {
        self.set_functionality(0)
    }

    /// Full functionality (normal operation).
    pub fn full_functionality(&self) -> Result<()> {
        self.set_functionality(1)
    }

    /// Power the module down (`AT+CPOWD`). The modem may stop responding
    /// before the reply arrives, so nothing here is treated as an error.
    pub fn power_down(&self, urgent: bool) {
        let mode = u8::from(!urgent);
        let result = self.at.command_with(
            &format!("AT+CPOWD={mode}"),
            CommandOpts {
                timeout: Duration::from_secs(5),
                expect_ok: false,
                ..CommandOpts::default()
            },
        );
        if let Err(e) = result {
            debug!("CPOWD without reply (expected): {e}");
        }
    }
}
