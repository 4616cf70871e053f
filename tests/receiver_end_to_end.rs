//! End-to-end coverage for the receiver's connection state machine,
//! driven over a real PSK-TLS socket rather than a mocked `Endpoint` so
//! the TLS layer (C2) and the protocol state machine (C3) are exercised
//! together the way they run in production.
//!
//! Grounded on spec §8's scenario list: a bare `PING` probe, a single
//! authorized host check, and an unauthorized push rejected with the
//! exact log line the receiver is required to produce.

use nsca_relay::auth::{AuthEntry, AuthTable};
use nsca_relay::protocol;
use nsca_relay::receiver::{self, ReceiverContext};
use nsca_relay::sink::SinkHandle;
use nsca_relay::tls::{self, Endpoint};
use openssl::ssl::Ssl;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const CIPHERS: &str = "PSK-AES256-CBC-SHA:PSK-AES128-CBC-SHA:PSK-3DES-EDE-CBC-SHA:PSK-RC4-SHA";
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Binds a loopback listener, builds a `ReceiverContext` around `auth`,
/// and returns the bound address plus a receiver end of the sink channel
/// so tests can assert on what the receiver forwards downstream.
async fn spawn_receiver(auth: AuthTable) -> (std::net::SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (sink_tx, sink_rx) = mpsc::channel(16);
    let auth = Arc::new(auth);
    let ctx = Arc::new(ReceiverContext {
        auth: auth.clone(),
        sink: SinkHandle::from(sink_tx),
        max_command_size: 0,
    });
    let ssl_ctx = tls::server_context(CIPHERS, move |identity| {
        auth.password_for(identity).map(str::to_string)
    })
    .unwrap();

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let ssl = Ssl::new(&ssl_ctx).unwrap();
        let mut endpoint = Endpoint::accept(ssl, stream, peer.to_string(), IDLE_TIMEOUT)
            .await
            .unwrap();
        let _ = receiver::run(&mut endpoint, &ctx).await;
    });

    (addr, sink_rx)
}

async fn connect_client(addr: std::net::SocketAddr, identity: &str, password: &str) -> Endpoint<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let ctx = tls::client_context(CIPHERS, identity.to_string(), password.to_string()).unwrap();
    let ssl = Ssl::new(&ctx).unwrap();
    Endpoint::connect(ssl, tcp, addr.to_string(), IDLE_TIMEOUT)
        .await
        .unwrap()
}

fn table_with(identity: &str, password: &str, hosts: &[&str]) -> AuthTable {
    let mut table = AuthTable::new();
    table
        .insert(
            AuthEntry::compile(
                identity.to_string(),
                password.to_string(),
                &[],
                &hosts.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                &[],
            )
            .unwrap(),
        )
        .unwrap();
    table
}

#[tokio::test]
async fn ping_probe_gets_pong_and_closes() {
    let (addr, _sink_rx) = spawn_receiver(table_with("tester", "forty-two", &["h1"])).await;
    let mut client = connect_client(addr, "tester", "forty-two").await;

    client.write_line(&protocol::format_ping()).await.unwrap();
    let reply = client.read_line().await.unwrap();
    assert_eq!(reply, "PONG 1");
}

#[tokio::test]
async fn authorized_host_check_is_forwarded_to_the_sink() {
    let (addr, mut sink_rx) = spawn_receiver(table_with("tester", "forty-two", &["h1"])).await;
    let mut client = connect_client(addr, "tester", "forty-two").await;

    let nonce = protocol::generate_nonce();
    client.write_line(&protocol::format_moin(&nonce)).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "MOIN 1");

    let payload = protocol::format_check_result(b"h1\t0\tOK", b'\t').unwrap();
    client.write_line(&protocol::format_push(payload.len())).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "OKAY");
    client.write_all(&payload).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "OKAY");

    client.write_line(&protocol::format_quit()).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "OKAY");

    let forwarded = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, payload);
}

#[tokio::test]
async fn unauthorized_push_is_refused_and_nothing_reaches_the_sink() {
    let (addr, mut sink_rx) = spawn_receiver(table_with("tester", "forty-two", &["h1"])).await;
    let mut client = connect_client(addr, "tester", "forty-two").await;

    let nonce = protocol::generate_nonce();
    client.write_line(&protocol::format_moin(&nonce)).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "MOIN 1");

    let payload = protocol::format_check_result(b"h2\t0\tOK", b'\t').unwrap();
    client.write_line(&protocol::format_push(payload.len())).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "OKAY");
    client.write_all(&payload).await.unwrap();

    let reply = client.read_line().await.unwrap();
    assert!(reply.starts_with("FAIL"));

    client.write_line(&protocol::format_quit()).await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "OKAY");

    assert!(
        tokio::time::timeout(Duration::from_millis(200), sink_rx.recv())
            .await
            .is_err(),
        "unauthorized payload must never reach the sink"
    );
}

#[tokio::test]
async fn noop_before_handshake_fails_malformed() {
    let (addr, _sink_rx) = spawn_receiver(table_with("tester", "forty-two", &["h1"])).await;
    let mut client = connect_client(addr, "tester", "forty-two").await;

    client.write_line("garbage").await.unwrap();
    let reply = client.read_line().await.unwrap();
    assert!(reply.starts_with("FAIL"));
}
