#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! sim800ctl — host-side driver for SIM800-class cellular modems.
//!
//! Talks the AT command language over a raw serial port and layers the
//! usual modem services on top:
//! - `at` — the serialized command channel (framing, echo filter, URC
//!   waits, CME/CMS error parsing, sleep wake)
//! - `network` — registration, SIM, signal, identity
//! - `gprs` — SAPBR bearer lifecycle
//! - `http` — GET/HEAD/POST over the modem's embedded HTTP stack
//! - `sms` — text-mode send/list/read/delete with UCS-2 support
//! - `info` / `power` — device status and CFUN/CSCLK/CPOWD
//! - `session` — scoped bring-up/tear-down composite
//! - `device` — the facade tying it together
//!
//! ```no_run
//! use sim800ctl::{Device, SessionConfig};
//!
//! fn main() -> sim800ctl::Result<()> {
//!     let device = Device::open("/dev/ttyUSB0", 115_200, None)?;
//!     let session = device.session(SessionConfig::new("internet"))?;
//!     let response = session.http_get("http://example.com")?;
//!     println!("{} {}", response.status_code, response.text());
//!     Ok(())
//! }
//! ```

pub mod at;
pub mod config;
pub mod device;
pub mod error;
pub mod gprs;
pub mod http;
pub mod info;
pub mod lock;
pub mod network;
pub mod power;
pub mod session;
pub mod sms;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use at::{AtChannel, AtResponse, CommandOpts};
pub use config::ModemConfig;
pub use device::Device;
pub use error::{AtErrorDetails, Error, Result};
pub use gprs::BearerStatus;
pub use http::HttpResponse;
pub use network::SignalQuality;
pub use session::{Session, SessionConfig};
pub use sms::SmsMessage;
