//! Non-blocking TLS-PSK transport (C2), mapped onto `tokio-openssl` the
//! way the design notes direct: one async task per connection rather
//! than a callback-driven single-threaded reactor. The SSL retry
//! requirement ("same buffer and length") is handled for us by
//! `tokio-openssl`'s `AsyncRead`/`AsyncWrite` impls, which already hold
//! the in-flight buffer across a pending `WANT_READ`/`WANT_WRITE`
//! internally; we only need to preserve it across our own `.await`
//! points, which owning it on the task's stack does for free.
//!
//! Grounded on `examples/original_source/src/common/tls.c`
//! (`SSL_CTX_set_psk_client_callback` / `_server_callback`, cipher list,
//! `SSL_OP_NO_SSLv2`/`SSL_OP_NO_SSLv3`, partial-write mode) and on the
//! teacher crate's own `SslConnector`/`SslAcceptor` usage in
//! `countermeasures/src/bin/{client,server}.rs`.

use crate::buffer::ByteBuffer;
use crate::error::Error;
use crate::protocol::MAX_LINE_LENGTH;
use lazy_static::lazy_static;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslMode, SslOptions, SslRef, SslVerifyMode};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_openssl::SslStream;

lazy_static! {
    /// Index used to stash the PSK identity presented by a connecting
    /// client so it can be read back after the handshake completes; the
    /// server-side PSK callback only has access to `&mut SslRef`, not
    /// the surrounding connection state.
    static ref PSK_IDENTITY_INDEX: openssl::ex_data::Index<openssl::ssl::Ssl, String> =
        Ssl::new_ex_index().expect("failed to allocate SSL ex_data index");
}

/// Builds a client-side `SslContext` configured for PSK authentication:
/// PSK cipher suites only, SSLv2/SSLv3 disabled, partial-write mode on.
pub fn client_context(ciphers: &str, identity: String, password: String) -> Result<SslContext, Error> {
    let mut builder = SslContext::builder(SslMethod::tls())?;
    builder.set_cipher_list(ciphers)?;
    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE);
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let id_bytes = identity.as_bytes();
        if id_bytes.len() >= identity_out.len() {
            return Err(openssl::error::ErrorStack::get());
        }
        identity_out[..id_bytes.len()].copy_from_slice(id_bytes);
        identity_out[id_bytes.len()] = 0;
        let pw_bytes = password.as_bytes();
        let n = pw_bytes.len().min(psk_out.len());
        psk_out[..n].copy_from_slice(&pw_bytes[..n]);
        Ok(n)
    });
    Ok(builder.build())
}

/// Builds a server-side `SslContext`. `lookup` resolves an authenticated
/// identity to its configured password (or the `*` fallback); it is the
/// Rust analogue of `check_psk(ssl, identity, out, max) -> length`.
pub fn server_context<F>(ciphers: &str, lookup: F) -> Result<SslContext, Error>
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let mut builder = SslContext::builder(SslMethod::tls())?;
    builder.set_cipher_list(ciphers)?;
    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE);
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_psk_server_callback(move |ssl, identity, psk_out| {
        let identity = identity.unwrap_or(b"");
        let identity_str = String::from_utf8_lossy(identity).into_owned();
        let password = match lookup(&identity_str) {
            Some(p) => p,
            None => return Ok(0),
        };
        ssl.set_ex_data(*PSK_IDENTITY_INDEX, identity_str);
        let pw_bytes = password.as_bytes();
        let n = pw_bytes.len().min(psk_out.len());
        psk_out[..n].copy_from_slice(&pw_bytes[..n]);
        Ok(n)
    });
    Ok(builder.build())
}

/// Reads the identity the PSK handshake callback stashed for this
/// connection, if any.
pub fn handshake_identity(ssl: &SslRef) -> Option<String> {
    ssl.ex_data(*PSK_IDENTITY_INDEX).cloned()
}

/// Per-connection read/write state: the TLS stream plus the buffered
/// line-reading state the spec's C1/C2 split calls for. One instance is
/// owned by the `tokio::spawn`ed task handling that connection.
pub struct Endpoint<S> {
    stream: SslStream<S>,
    peer_addr: String,
    label: String,
    idle_timeout: Duration,
    input: ByteBuffer,
}

impl<S> Endpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: SslStream<S>, peer_addr: String, idle_timeout: Duration) -> Self {
        Endpoint {
            stream,
            label: peer_addr.clone(),
            peer_addr,
            idle_timeout,
            input: ByteBuffer::new(),
        }
    }

    /// The fixed peer address this endpoint was constructed with (the TCP
    /// peer address on the server side, the configured host on the client
    /// side) — independent of whatever the connection id adorns `label`
    /// with.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// The peer label, initially equal to `peer_addr` and adorned with a
    /// connection id (the handshake nonce) once the handshake completes.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Adorns the peer label with `id` for logging, per `set_connection_id`.
    pub fn set_connection_id(&mut self, id: &str) {
        self.label = format!("{} ({})", self.peer_addr, id);
    }

    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Connects the TLS layer over an already-established transport
    /// stream, client role.
    pub async fn connect(ssl: Ssl, transport: S, label: String, idle_timeout: Duration) -> Result<Self, Error>
    where
        S: 'static,
    {
        let mut stream = SslStream::new(ssl, transport)?;
        timeout(idle_timeout, Pin::new(&mut stream).connect())
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(Endpoint::new(stream, label, idle_timeout))
    }

    /// Accepts the TLS layer over an already-established transport
    /// stream, server role.
    pub async fn accept(ssl: Ssl, transport: S, label: String, idle_timeout: Duration) -> Result<Self, Error>
    where
        S: 'static,
    {
        let mut stream = SslStream::new(ssl, transport)?;
        timeout(idle_timeout, Pin::new(&mut stream).accept())
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(Endpoint::new(stream, label, idle_timeout))
    }

    /// Reads bytes from the socket into the line-parsing buffer until a
    /// full `\r\n`- or `\n`-terminated line is present, honoring the
    /// 2048-byte line-too-long ceiling.
    pub async fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(line) = self.input.read_line() {
                if line.len() > MAX_LINE_LENGTH {
                    return Err(Error::LineTooLong);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.input.size() > MAX_LINE_LENGTH {
                return Err(Error::LineTooLong);
            }
            self.fill().await?;
        }
    }

    /// Reads exactly `n` bytes of payload, buffering as many socket
    /// reads as necessary.
    pub async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        while self.input.size() < n {
            self.fill().await?;
        }
        Ok(self.input.read_alloc(n))
    }

    async fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 4096];
        let n = timeout(self.idle_timeout, self.stream.read(&mut chunk))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        self.input.append(&chunk[..n]);
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        timeout(self.idle_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        let mut out = line.as_bytes().to_vec();
        out.extend_from_slice(b"\r\n");
        self.write_all(&out).await
    }

    /// Drains any buffered output implicitly (writes are not queued in
    /// this design, see module doc) then starts TLS close-notify.
    /// Best-effort: a failure or timeout here simply means the
    /// connection is torn down without a clean shutdown handshake.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let _ = timeout(self.idle_timeout, self.stream.shutdown()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ex_data_index_is_reusable() {
        // Smoke test that the lazy_static index initializes without panicking
        // and that looking up an identity before the PSK callback ever ran
        // yields None rather than panicking.
        let ctx = SslContext::builder(SslMethod::tls()).unwrap().build();
        let ssl = Ssl::new(&ctx).unwrap();
        assert_eq!(handshake_identity(&ssl), None);
    }
}
