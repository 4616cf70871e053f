#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

//! CLI glue (C7) for the submitter process: reads an optional TOML
//! config, merges CLI overrides, opens the PSK-TLS connection, and
//! drives `nsca_relay::submitter::run` against stdin.
//!
//! Grounded on `countermeasures/src/bin/client.rs`'s `main`/`run` split
//! (env_logger setup, a `StructOpt` CLI struct, a `tokio::runtime`
//! spun up by hand) and on `examples/original_source/src/client/main.c`
//! for the flag set itself (identity/password/server/port/timeout/delay,
//! raw-command mode, field delimiter, record separator).

use failure::Fail;
use log::info;
use nsca_relay::config::SubmitterConfig;
use nsca_relay::error::Error;
use nsca_relay::submitter::{self, Mode};
use nsca_relay::tls::{self, Endpoint};
use openssl::ssl::Ssl;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpStream;

#[derive(Debug, StructOpt)]
#[structopt(name = "submitter", about = "Submit monitoring commands to a receiver")]
struct CliArgs {
    /// Path to a TOML configuration file.
    #[structopt(long = "config", short = "c")]
    config: Option<PathBuf>,

    /// Treat stdin records as pre-formatted commands instead of
    /// tab-delimited check results.
    #[structopt(long = "raw")]
    raw: bool,

    /// Field delimiter for CHECK_RESULT mode (single char or `\t`/`\n`/`\xNN`).
    #[structopt(long = "delimiter", default_value = "\\t")]
    delimiter: String,

    /// Record separator between stdin chunks (single char or escape).
    #[structopt(long = "separator")]
    separator: Option<String>,

    /// Identity presented during the PSK handshake.
    #[structopt(long = "identity")]
    identity: Option<String>,

    /// PSK password for that identity.
    #[structopt(long = "password")]
    password: Option<String>,

    /// Receiver host.
    #[structopt(long = "host", short = "H")]
    host: Option<String>,

    /// Receiver port.
    #[structopt(long = "port", short = "p")]
    port: Option<u16>,

    /// Idle timeout in seconds.
    #[structopt(long = "timeout")]
    timeout: Option<f64>,

    /// Startup delay in seconds, applied before connecting.
    #[structopt(long = "delay")]
    delay: Option<f64>,

    /// Log level (error, warn, info, debug, trace).
    #[structopt(long = "log-level", default_value = "info")]
    log_level: String,
}

fn parse_byte_spec(s: &str) -> Result<u8, String> {
    match s {
        "\\t" => Ok(b'\t'),
        "\\n" => Ok(b'\n'),
        "\\0" => Ok(0),
        _ if s.starts_with("\\x") && s.len() == 4 => {
            u8::from_str_radix(&s[2..], 16).map_err(|e| e.to_string())
        }
        _ if s.chars().count() == 1 => Ok(s.as_bytes()[0]),
        other => Err(format!("invalid byte spec: {:?}", other)),
    }
}

fn main() {
    if let Err(err) = run() {
        let mut out = std::io::stderr();
        let _ = writeln!(out, "submitter: fatal error:");
        for fail in Fail::iter_chain(&err) {
            let _ = writeln!(out, "  {}", fail);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let args = CliArgs::from_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .format_timestamp_secs()
        .init();

    let config = match &args.config {
        Some(path) => SubmitterConfig::load(path)?,
        None => SubmitterConfig::default(),
    };

    let identity = args
        .identity
        .clone()
        .or(config.identity.clone())
        .ok_or_else(|| Error::Config("no identity configured".to_string()))?;
    let password = args
        .password
        .clone()
        .or(config.password.clone())
        .ok_or_else(|| Error::Config("no password configured".to_string()))?;
    let host = args
        .host
        .clone()
        .or(config.server.clone())
        .ok_or_else(|| Error::Config("no server host configured".to_string()))?;
    let port = args.port.or(config.port).unwrap_or(5668);
    let timeout = Duration::from_secs_f64(args.timeout.or(config.timeout).unwrap_or(10.0));
    let delay = args.delay.or(config.delay).unwrap_or(0.0);
    let ciphers = config.tls_ciphers();

    let delimiter = parse_byte_spec(&args.delimiter).map_err(Error::Config)?;
    let mode = if args.raw {
        Mode::Command
    } else {
        Mode::CheckResult {
            field_delimiter: delimiter,
        }
    };
    let separator = match &args.separator {
        Some(sep) => {
            let sep_byte = parse_byte_spec(sep).map_err(Error::Config)?;
            if !args.raw && sep_byte == delimiter {
                return Err(Error::Config(
                    "record separator must differ from field delimiter".to_string(),
                ));
            }
            sep_byte
        }
        None => mode.record_separator(),
    };

    let rt = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    rt.block_on(async_run(
        host, port, identity, password, ciphers, timeout, delay, mode, separator,
    ))
}

async fn async_run(
    host: String,
    port: u16,
    identity: String,
    password: String,
    ciphers: String,
    timeout: Duration,
    delay: f64,
    mode: Mode,
    separator: u8,
) -> Result<(), Error> {
    if delay > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    let addr = format!("{}:{}", host, port);
    info!("connecting to {}", addr);
    let tcp = TcpStream::connect(&addr).await?;
    tcp.set_nodelay(true)?;

    let ctx = tls::client_context(&ciphers, identity, password)?;
    let ssl = Ssl::new(&ctx)?;
    let mut endpoint = Endpoint::connect(ssl, tcp, host.clone(), timeout).await?;

    submitter::run(&mut endpoint, tokio::io::stdin(), mode, separator).await
}
