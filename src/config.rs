//! Command-line flags and the validated run configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::message::MessageError;

#[derive(Parser, Debug)]
#[command(name = "wsload")]
#[command(about = "WebSocket client and load generator", long_about = None)]
pub struct Cli {
    /// WebSocket connection URL
    #[arg(short = 'c', long = "connect", env = "WS_CONNECT_URL")]
    pub connect: String,

    /// Custom headers (key:value, can be used multiple times)
    #[arg(short = 'H', long = "header")]
    pub header: Vec<String>,

    /// Send this message after connecting (can be used multiple times)
    #[arg(short = 'x', long = "execute")]
    pub execute: Vec<String>,

    /// How long to keep the connection open after executing (1s, 1m, 1h)
    #[arg(short = 'w', long = "wait", env = "WS_WAIT", default_value = "0s", value_parser = humantime::parse_duration)]
    pub wait: Duration,

    /// Enable load generation mode
    #[arg(long, env = "WS_PERF")]
    pub perf: bool,

    /// Total number of connections to create
    #[arg(long = "tc", env = "WS_TOTAL_CONNS", default_value_t = 0)]
    pub total_conns: u64,

    /// Number of connections to add every second
    #[arg(long = "rups", env = "WS_RAMP_UP_PER_SEC", default_value_t = 1)]
    pub ramp_up_per_sec: u64,

    /// Load message template or file path
    #[arg(long = "lm", env = "WS_LOAD_MESSAGE", default_value = "")]
    pub load_message: String,

    /// Interval between load messages (0 sends exactly once)
    #[arg(long = "mi", env = "WS_MESSAGE_INTERVAL", default_value = "0s", value_parser = humantime::parse_duration)]
    pub message_interval: Duration,

    /// Auth message template or file path, sent right after connecting
    #[arg(long = "am", env = "WS_AUTH_MESSAGE", default_value = "")]
    pub auth_message: String,

    /// Wait before sending the auth message
    #[arg(long = "wba", env = "WS_WAIT_BEFORE_AUTH", default_value = "0s", value_parser = humantime::parse_duration)]
    pub wait_before_auth: Duration,

    /// Wait after the auth message before sending load
    #[arg(long = "waa", env = "WS_WAIT_AFTER_AUTH", default_value = "0s", value_parser = humantime::parse_duration)]
    pub wait_after_auth: Duration,

    /// Write periodic stats to this file instead of the terminal
    #[arg(long = "outfile", env = "WS_OUT_FILE")]
    pub out_file: Option<PathBuf>,

    /// How often to render the stats table
    #[arg(long = "print-interval", env = "WS_PRINT_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub print_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("total number of connections are required")]
    MissingConnections,
    #[error("invalid connect url {url}: {reason}")]
    BadUrl { url: String, reason: String },
    #[error("invalid header {0:?}, expected key:value")]
    BadHeader(String),
    #[error("print interval must be positive")]
    ZeroPrintInterval,
    #[error("error with the {role} message: {source}")]
    Message {
        role: &'static str,
        source: MessageError,
    },
    #[error("error while opening the output file {path}: {source}")]
    OutFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Immutable for the whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub total_conns: u64,
    pub ramp_up_per_sec: u64,
    pub load_message: String,
    pub message_interval: Duration,
    pub auth_message: String,
    pub wait_before_auth: Duration,
    pub wait_after_auth: Duration,
    pub out_file: Option<PathBuf>,
    pub print_interval: Duration,
}

impl Cli {
    pub fn run_config(&self) -> Result<RunConfig, ConfigError> {
        let url = url::Url::parse(&self.connect).map_err(|err| ConfigError::BadUrl {
            url: self.connect.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::BadUrl {
                url: self.connect.clone(),
                reason: "scheme must be ws or wss".to_owned(),
            });
        }

        let mut headers = Vec::with_capacity(self.header.len());
        for raw in &self.header {
            let (key, value) = raw
                .split_once(':')
                .ok_or_else(|| ConfigError::BadHeader(raw.clone()))?;
            headers.push((key.trim().to_owned(), value.trim().to_owned()));
        }

        if self.print_interval.is_zero() {
            return Err(ConfigError::ZeroPrintInterval);
        }

        Ok(RunConfig {
            url: self.connect.clone(),
            headers,
            total_conns: self.total_conns,
            ramp_up_per_sec: self.ramp_up_per_sec,
            load_message: self.load_message.clone(),
            message_interval: self.message_interval,
            auth_message: self.auth_message.clone(),
            wait_before_auth: self.wait_before_auth,
            wait_after_auth: self.wait_after_auth,
            out_file: self.out_file.clone(),
            print_interval: self.print_interval,
        })
    }
}
