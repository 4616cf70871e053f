//! Submitter-side protocol state machine (C3 client half).
//!
//! Grounded on `examples/original_source/src/client/nsca-ng.c`'s main
//! loop and `parse.c`'s response handling: generate a nonce, exchange
//! `MOIN`, then repeatedly format one input chunk, `PUSH` it, and await
//! two `OKAY`s before asking for the next chunk. `QUIT` on stdin EOF.

use crate::error::Error;
use crate::input::InputReader;
use crate::protocol;
use crate::tls::Endpoint;
use log::{error, info};
use tokio::io::{AsyncRead, AsyncWrite};

/// Whether stdin records are pre-formatted monitoring commands (`COMMAND`)
/// or tab-delimited check results (`CHECK_RESULT`, the default).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    CheckResult { field_delimiter: u8 },
    Command,
}

impl Mode {
    /// The default record separator between stdin chunks for this mode,
    /// overridable by the caller (the submitter binary's `--separator`).
    pub fn record_separator(self) -> u8 {
        match self {
            Mode::CheckResult { .. } => 0x1b,
            Mode::Command => b'\n',
        }
    }
}

/// Drives one submission session to completion. Returns `Ok(())` on a
/// clean `QUIT`/`OKAY` exchange; any protocol violation or server
/// refusal becomes an `Err`, which the caller (the `submitter` binary)
/// turns into a non-zero exit code.
pub async fn run<S, R>(endpoint: &mut Endpoint<S>, input: R, mode: Mode, separator: u8) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let nonce = protocol::generate_nonce();
    endpoint.set_connection_id(&nonce);
    endpoint.write_line(&protocol::format_moin(&nonce)).await?;

    let greeting = endpoint.read_line().await?;
    let tokens = protocol::tokenize(greeting.as_bytes())?;
    match tokens.as_slice() {
        [verb, ver] if protocol::verb_is(verb, "MOIN") && ver == "1" => {}
        other => {
            let reason = format!("unexpected handshake reply: {:?}", other);
            let _ = endpoint.write_line(&protocol::format_bail(&reason)).await;
            endpoint.shutdown().await?;
            return Err(Error::Protocol(reason));
        }
    }

    let mut reader = InputReader::new(input, separator);
    loop {
        let chunk = match reader.read_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Err(Error::Io(e)),
        };

        let formatted = match mode {
            Mode::CheckResult { field_delimiter } => {
                protocol::format_check_result(&chunk, field_delimiter)?
            }
            Mode::Command => protocol::format_raw_command(&chunk)?,
        };

        submit_one(endpoint, &formatted).await?;
    }

    endpoint.write_line(&protocol::format_quit()).await?;
    await_okay(endpoint).await?;
    endpoint.shutdown().await?;
    info!("submission session complete");
    Ok(())
}

async fn submit_one<S>(endpoint: &mut Endpoint<S>, payload: &[u8]) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    endpoint
        .write_line(&protocol::format_push(payload.len()))
        .await?;
    await_okay(endpoint).await?;
    endpoint.write_all(payload).await?;
    await_okay(endpoint).await?;
    Ok(())
}

/// Reads one response line, accepting `OKAY` and treating `FAIL`/`BAIL`
/// (or any other verb) as fatal to the submission session.
async fn await_okay<S>(endpoint: &mut Endpoint<S>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = endpoint.read_line().await?;
    let tokens = protocol::tokenize(line.as_bytes())?;
    match tokens.first().map(String::as_str) {
        Some(verb) if protocol::verb_is(verb, "OKAY") => Ok(()),
        Some(verb) if protocol::verb_is(verb, "FAIL") => {
            let reason = tokens[1..].join(" ");
            error!("server refused request: {}", reason);
            endpoint.shutdown().await?;
            Err(Error::Protocol(format!("FAIL {}", reason)))
        }
        Some(verb) if protocol::verb_is(verb, "BAIL") => {
            let reason = tokens[1..].join(" ");
            error!("server aborted session: {}", reason);
            endpoint.shutdown().await?;
            Err(Error::Protocol(format!("BAIL {}", reason)))
        }
        _ => {
            let reason = format!("unexpected response: {:?}", line);
            let _ = endpoint.write_line(&protocol::format_bail(&reason)).await;
            endpoint.shutdown().await?;
            Err(Error::Protocol(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Mode;

    #[test]
    fn check_result_mode_uses_escape_separator() {
        assert_eq!(Mode::CheckResult { field_delimiter: b'\t' }.record_separator(), 0x1b);
    }

    #[test]
    fn command_mode_uses_newline_separator() {
        assert_eq!(Mode::Command.record_separator(), b'\n');
    }
}
