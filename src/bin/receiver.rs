#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

//! CLI glue (C7) for the receiver process: loads config, builds the
//! authorization table and sink, accepts PSK-TLS connections, and
//! drives `nsca_relay::receiver::run` per connection.
//!
//! Grounded on `countermeasures/src/bin/server.rs`'s accept loop
//! (`for_each_concurrent` over `TcpListener::incoming`) and on
//! `examples/original_source/src/server/nsca-ng.c`'s startup sequence
//! for the PID file and `SIGHUP`-triggered re-exec.

use failure::Fail;
use log::{error, info, warn};
use nsca_relay::auth::{AuthEntry, AuthTable};
use nsca_relay::config::ReceiverConfig;
use nsca_relay::error::Error;
use nsca_relay::print_error;
use nsca_relay::receiver::{self, ReceiverContext};
use nsca_relay::sink::{self, SinkConfig};
use nsca_relay::tls::{self, Endpoint};
use openssl::ssl::{Ssl, SslContext};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;

#[derive(Debug, StructOpt)]
#[structopt(name = "receiver", about = "Authorize and dispatch monitoring commands")]
struct CliArgs {
    /// Path to a TOML configuration file.
    #[structopt(long = "config", short = "c")]
    config: Option<PathBuf>,

    /// Listen address, e.g. `*:5668` or `127.0.0.1:5668`.
    #[structopt(long = "bind", short = "b")]
    bind: Option<String>,

    /// Path to the named pipe the external monitoring engine reads.
    #[structopt(long = "command-file")]
    command_file: Option<String>,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[structopt(long = "foreground", short = "f")]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace).
    #[structopt(long = "log-level")]
    log_level: Option<String>,

    /// Path to write this process's PID to.
    #[structopt(long = "pid-file")]
    pid_file: Option<String>,

    /// Log to stderr in addition to (or instead of) syslog.
    #[structopt(long = "log-stderr")]
    log_stderr: bool,

    /// Log to syslog. Out of scope beyond accepting the flag (see
    /// spec §1's "syslog/stderr logging sinks" non-goal); this binary
    /// always logs via `env_logger` to stderr.
    #[structopt(long = "log-syslog")]
    log_syslog: bool,
}

fn main() {
    if let Err(err) = run() {
        let mut out = std::io::stderr();
        let _ = writeln!(out, "receiver: fatal error:");
        for fail in Fail::iter_chain(&err) {
            let _ = writeln!(out, "  {}", fail);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let args = CliArgs::from_args();
    let config = match &args.config {
        Some(path) => ReceiverConfig::load(path)?,
        None => ReceiverConfig::default(),
    };

    let log_level = args
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level))
        .format_timestamp_secs()
        .init();

    if !args.foreground {
        info!("daemonization is out of scope for this build; running in foreground");
    }

    let pid_file = args.pid_file.clone().or_else(|| config.pid_file.clone());
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| Error::Config(format!("cannot write pid file {}: {}", path, e)))?;
    }

    let rt = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    let result = rt.block_on(async_run(args, config));

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }
    result
}

async fn async_run(args: CliArgs, config: ReceiverConfig) -> Result<(), Error> {
    let bind = args.bind.clone().unwrap_or_else(|| config.listen.clone());
    let listen_addr = bind.replace('*', "0.0.0.0");
    let command_file = args
        .command_file
        .clone()
        .or_else(|| config.command_file.clone())
        .ok_or_else(|| Error::Config("no command_file configured".to_string()))?;

    let mut auth = AuthTable::new();
    for entry in &config.authorize {
        auth.insert(AuthEntry::compile(
            entry.identity.clone(),
            entry.password.clone(),
            &entry.commands,
            &entry.hosts,
            &entry.services,
        )?)?;
    }
    let auth = Arc::new(auth);

    let (sink_handle, sink_task) = sink::spawn(SinkConfig {
        path: PathBuf::from(command_file),
        temp_directory: PathBuf::from(config.temp_directory.clone()),
        max_queue_size: config.max_queue_size_bytes(),
    });

    let ctx = Arc::new(ReceiverContext {
        auth: auth.clone(),
        sink: sink_handle,
        max_command_size: config.max_command_size,
    });

    let ssl_ctx = build_server_context(&config, auth)?;
    let idle_timeout = Duration::from_secs_f64(config.timeout);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("listening on {}", listen_addr);

    let mut sighup = signal(SignalKind::hangup()).map_err(Error::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Io)?;

    // One task per connection, tracked so a graceful shutdown can await
    // every in-flight connection before closing the sink.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        connections.spawn(print_error(handle_connection(
                            stream,
                            peer.to_string(),
                            ssl_ctx.clone(),
                            ctx.clone(),
                            idle_timeout,
                        )));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    warn!("connection task panicked: {}", e);
                }
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, re-executing to reload configuration");
                reexec();
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    // Teardown, in spec §5's buffer→tls_server→fifo order: stop accepting
    // new connections first, drain every in-flight connection (each frees
    // its own TLS endpoint and buffers when its task returns), then close
    // the sink last so whatever it still has queued gets a chance to
    // flush instead of being dropped when the process exits.
    drop(listener);
    info!("waiting for {} in-flight connection(s) to finish", connections.len());
    while let Some(result) = connections.join_next().await {
        if let Err(e) = result {
            warn!("connection task panicked: {}", e);
        }
    }

    drop(ctx);
    info!("flushing sink");
    sink_task.shutdown().await;

    Ok(())
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: String,
    ssl_ctx: SslContext,
    ctx: Arc<ReceiverContext>,
    idle_timeout: Duration,
) -> Result<(), Error> {
    let ssl = Ssl::new(&ssl_ctx)?;
    let mut endpoint = Endpoint::accept(ssl, stream, peer, idle_timeout).await?;
    receiver::run(&mut endpoint, &ctx).await
}

fn build_server_context(config: &ReceiverConfig, auth: Arc<AuthTable>) -> Result<SslContext, Error> {
    let ciphers = config.tls_ciphers.clone();
    tls::server_context(&ciphers, move |identity| auth.password_for(identity).map(str::to_string))
}

/// Replaces this process image to reload configuration, matching the
/// original daemon's `SIGHUP` behavior. `exec` only returns on failure;
/// per spec §9, a failed reload is logged and the process keeps running
/// on its current configuration rather than crashing.
fn reexec() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("re-exec failed, continuing on current configuration: {}", e);
            return;
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = std::process::Command::new(exe).args(&args).exec();
    error!("re-exec failed, continuing on current configuration: {}", err);
}
