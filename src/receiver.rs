//! Receiver-side protocol state machine (C3 server half).
//!
//! Grounded on `examples/original_source/src/server/nsca-ng.c`'s
//! `conn_read_cb`: handshake first (`MOIN <ver> <nonce>` or a
//! pre-handshake `PING`), then loop accepting `NOOP`/`PUSH`/`QUIT`/`BAIL`
//! until the peer disconnects or a fatal condition (`BAIL`, timeout,
//! line-too-long) tears the connection down.

use crate::auth::AuthTable;
use crate::error::Error;
use crate::protocol;
use crate::sink::SinkHandle;
use crate::tls::Endpoint;
use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub struct ReceiverContext {
    pub auth: Arc<AuthTable>,
    pub sink: SinkHandle,
    pub max_command_size: usize,
}

/// Drives one accepted connection from handshake to disconnect. Every
/// error path here is connection-local: the caller logs and drops the
/// connection, never the whole process (AUTO_DIE is off on the
/// receiver).
pub async fn run<S>(endpoint: &mut Endpoint<S>, ctx: &ReceiverContext) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = match handshake(endpoint).await? {
        Some(identity) => identity,
        None => return Ok(()), // PING probe, already closed
    };

    loop {
        let line = match endpoint.read_line().await {
            Ok(line) => line,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(Error::LineTooLong) => {
                bail(endpoint, "Line too long").await;
                return Err(Error::LineTooLong);
            }
            Err(Error::Timeout) => {
                bail(endpoint, "Idle timeout").await;
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        };

        let tokens = match protocol::tokenize(line.as_bytes()) {
            Ok(tokens) => tokens,
            Err(_) => {
                endpoint
                    .write_line(&protocol::format_fail("Malformed request"))
                    .await?;
                continue;
            }
        };

        match tokens.first().map(String::as_str) {
            Some(verb) if protocol::verb_is(verb, "NOOP") => {
                endpoint.write_line(&protocol::format_okay()).await?;
            }
            Some(verb) if protocol::verb_is(verb, "PUSH") => {
                handle_push(endpoint, ctx, &identity, &tokens).await?;
            }
            Some(verb) if protocol::verb_is(verb, "QUIT") => {
                endpoint.write_line(&protocol::format_okay()).await?;
                endpoint.shutdown().await?;
                return Ok(());
            }
            Some(verb) if protocol::verb_is(verb, "BAIL") => {
                let reason = tokens.get(1..).map(|r| r.join(" ")).unwrap_or_default();
                warn!("{} aborted the session: {}", identity, reason);
                endpoint.shutdown().await?;
                return Ok(());
            }
            _ => {
                endpoint
                    .write_line(&protocol::format_fail("Unknown command"))
                    .await?;
            }
        }
    }
}

/// Reads the first line of a fresh connection. A `PING` probe replies
/// `PONG 1` and closes (returns `None`). A valid `MOIN <ver> <nonce>`
/// sets the connection label to the nonce and replies `MOIN 1`
/// (returns `Some(identity)`, the PSK-authenticated identity resolved
/// during the TLS handshake). Anything else is a `FAIL`, and the
/// handshake is retried.
async fn handshake<S>(endpoint: &mut Endpoint<S>) -> Result<Option<String>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = crate::tls::handshake_identity(endpoint.ssl()).unwrap_or_default();
    loop {
        let line = endpoint.read_line().await?;
        let tokens = protocol::tokenize(line.as_bytes())?;
        match tokens.as_slice() {
            [verb] if protocol::verb_is(verb, "PING") => {
                endpoint.write_line(&protocol::format_pong1()).await?;
                endpoint.shutdown().await?;
                return Ok(None);
            }
            [verb, ver, nonce] if protocol::verb_is(verb, "MOIN") => match ver.parse::<u32>() {
                Ok(v) if v >= 1 => {
                    endpoint.set_connection_id(nonce);
                    endpoint.write_line(&protocol::format_moin1()).await?;
                    info!("{} connected ({})", identity, endpoint.label());
                    return Ok(Some(identity));
                }
                _ => {
                    endpoint
                        .write_line(&protocol::format_fail("Unsupported protocol version"))
                        .await?;
                }
            },
            _ => {
                endpoint
                    .write_line(&protocol::format_fail("Expected MOIN"))
                    .await?;
            }
        }
    }
}

async fn handle_push<S>(
    endpoint: &mut Endpoint<S>,
    ctx: &ReceiverContext,
    identity: &str,
    tokens: &[String],
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let n = match tokens.get(1).and_then(|s| s.parse::<i64>().ok()) {
        Some(n) if n > 0 => n as usize,
        _ => {
            endpoint
                .write_line(&protocol::format_fail("Expected number of bytes"))
                .await?;
            return Ok(());
        }
    };
    if ctx.max_command_size > 0 && n > ctx.max_command_size {
        endpoint
            .write_line(&protocol::format_fail("PUSH data size too large"))
            .await?;
        return Ok(());
    }

    endpoint.write_line(&protocol::format_okay()).await?;
    let payload = endpoint.read_exact_n(n).await?;

    if ctx.auth.is_authorized(identity, &payload) {
        if ctx.sink.send(payload).await.is_err() {
            warn!("sink task has shut down, dropping accepted payload");
        }
        endpoint.write_line(&protocol::format_okay()).await?;
    } else {
        warn!("Refusing data from {}@{}", identity, endpoint.peer_addr());
        endpoint
            .write_line(&protocol::format_fail("You're not authorized"))
            .await?;
    }
    Ok(())
}

async fn bail<S>(endpoint: &mut Endpoint<S>, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = endpoint.write_line(&protocol::format_bail(reason)).await;
    let _ = endpoint.shutdown().await;
}
