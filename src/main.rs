#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # sim800ctl
//!
//! Command-line frontend for the SIM800 driver: device status, HTTP
//! requests over GPRS, SMS, and power management from a shell.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use sim800ctl::{Device, ModemConfig, SessionConfig};

/// Control a SIM800-class modem on a serial port.
#[derive(Parser)]
#[command(name = "sim800ctl", version)]
struct Cli {
    /// Path to TOML config file (default: ./sim800ctl.toml if present).
    #[arg(long)]
    config: Option<String>,

    /// Serial device (overrides config).
    #[arg(long)]
    port: Option<String>,

    /// Baudrate (overrides config).
    #[arg(long)]
    baud: Option<u32>,

    /// GPRS APN (overrides config; required for http/location commands).
    #[arg(long)]
    apn: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump device and network information as JSON.
    Info,
    /// Show signal quality (RSSI, dBm, bars).
    Signal,
    /// HTTP GET over a GPRS session.
    HttpGet {
        url: String,
        /// Request deadline in seconds.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// HTTP POST over a GPRS session.
    HttpPost {
        url: String,
        /// Request body.
        #[arg(long)]
        data: String,
        #[arg(long, default_value = "application/json")]
        content_type: String,
        /// Request deadline in seconds.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Send an SMS in text mode.
    SmsSend { number: String, text: String },
    /// List stored SMS messages.
    SmsList {
        /// CMGL filter: ALL, "REC UNREAD", "REC READ", ...
        #[arg(long, default_value = "ALL")]
        status: String,
    },
    /// Cell-tower location fix (needs a bearer, hence an APN).
    Location,
    /// Power management.
    Power {
        /// down | min | full | auto-sleep | no-sleep
        mode: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = ModemConfig::load(cli.config.as_deref());

    if let Some(port) = &cli.port {
        config.serial.path = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baudrate = baud;
    }
    if let Some(apn) = &cli.apn {
        config.gprs.apn = Some(apn.clone());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    match run(&cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Commands, config: &ModemConfig) -> sim800ctl::Result<()> {
    let device = Device::from_config(config)?;

    match command {
        Commands::Info => {
            device.at().sync()?;
            println!("{}", serde_json::to_string_pretty(&device.info_all())
                .unwrap_or_else(|_| "{}".to_string()));
        }
        Commands::Signal => {
            device.at().sync()?;
            let signal = device.network().signal()?;
            println!(
                "rssi={} ber={} dbm={} bars={}",
                signal.rssi,
                signal.ber,
                signal
                    .dbm()
                    .map_or_else(|| "?".to_string(), |d| d.to_string()),
                signal.bars()
            );
        }
        Commands::HttpGet { url, timeout } => {
            let session = device.session(session_config(config)?)?;
            let response = session.http_get_with(url, &[], Duration::from_secs(*timeout))?;
            eprintln!("HTTP {}", response.status_code);
            println!("{}", response.text());
        }
        Commands::HttpPost {
            url,
            data,
            content_type,
            timeout,
        } => {
            let session = device.session(session_config(config)?)?;
            let response = session.http_post_with(
                url,
                data.as_bytes(),
                content_type,
                &[],
                10_000,
                Duration::from_secs(*timeout),
            )?;
            eprintln!("HTTP {}", response.status_code);
            println!("{}", response.text());
        }
        Commands::SmsSend { number, text } => {
            device.at().sync()?;
            if device.sms().send(number, text) {
                println!("sent");
            } else {
                return Err(sim800ctl::Error::Sms("send failed".into()));
            }
        }
        Commands::SmsList { status } => {
            device.at().sync()?;
            let messages = device.sms().list(status)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&messages).unwrap_or_else(|_| "[]".to_string())
            );
        }
        Commands::Location => {
            let session = device.session(session_config(config)?)?;
            let (lat, lon) = session.location()?;
            println!("{lat},{lon}");
        }
        Commands::Power { mode } => {
            device.at().sync()?;
            let power = device.power();
            match mode.as_str() {
                "down" => power.power_down(false),
                "min" => power.minimum_functionality()?,
                "full" => power.full_functionality()?,
                "auto-sleep" => power.enable_auto_sleep()?,
                "no-sleep" => power.disable_sleep()?,
                other => {
                    return Err(sim800ctl::Error::Power(format!(
                        "unknown power mode {other:?} (down|min|full|auto-sleep|no-sleep)"
                    )))
                }
            }
        }
    }

    Ok(())
}

/// Session parameters from the merged configuration; the APN must be
/// present by now.
fn session_config(config: &ModemConfig) -> sim800ctl::Result<SessionConfig> {
    let apn = config.gprs.apn.clone().ok_or_else(|| {
        sim800ctl::Error::Gprs("no APN configured (use --apn or [gprs] apn)".into())
    })?;
    let mut session = SessionConfig::new(apn);
    session.cid = config.gprs.cid;
    session.user = config.gprs.user.clone();
    session.password = config.gprs.password.clone();
    session.keep_bearer_open = config.gprs.keep_bearer_open;
    Ok(session)
}
