use std::net::SocketAddr;
use std::sync::Arc;

use flow_audit::FlowLedger;
use http_assembler::Mode;
use rule_engine::RuleEngine;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipe::{Direction, PipeContext, run_pipe};

/// Configuration for the relay orchestrator.
pub struct RelayConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Address of the protected backend service.
    pub target_addr: SocketAddr,
    /// Shared policy engine; the management surface holds the same handle.
    pub engine: Arc<RuleEngine>,
    /// Session/stream correlator receiving every audit event.
    pub ledger: FlowLedger,
}

/// The relay orchestrator.
///
/// Accepts inbound connections, opens exactly one outbound connection per
/// inbound connection, and drives two independent directional pipes until
/// either finishes, at which point the whole connection is torn down.
pub struct Relay {
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind the configured listen address and serve forever.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(
            listen = %self.config.listen_addr,
            target = %self.config.target_addr,
            "relay listening"
        );
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Each connection is handled
    /// in its own task.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                handle_connection(stream, peer, config).await;
            });
        }
    }
}

/// Handle one connection from accept through relay to teardown.
///
/// Teardown always runs: both pipes are joined (each cancels the shared
/// token when it finishes, ending the other), the stream's audit record is
/// closed, and the sockets close when their halves drop.
async fn handle_connection(client: TcpStream, peer: SocketAddr, config: Arc<RelayConfig>) {
    let connection_id = Uuid::new_v4();
    tracing::info!(%connection_id, %peer, "connection accepted");

    let target = match TcpStream::connect(config.target_addr).await {
        Ok(target) => target,
        Err(err) => {
            tracing::error!(
                %connection_id,
                target = %config.target_addr,
                %err,
                "upstream unreachable; closing inbound connection"
            );
            return;
        }
    };

    let stream_id = config.ledger.start_stream(peer, config.target_addr).await;

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();
    let cancel = CancellationToken::new();

    let client_to_target = tokio::spawn(run_pipe(
        client_read,
        target_write,
        Mode::Request,
        PipeContext {
            connection_id,
            direction: Direction::ClientToTarget,
            engine: Arc::clone(&config.engine),
            ledger: config.ledger.clone(),
            stream_id,
            client_ip: peer.ip(),
            target_port: config.target_addr.port(),
        },
        cancel.clone(),
    ));
    let target_to_client = tokio::spawn(run_pipe(
        target_read,
        client_write,
        Mode::Response,
        PipeContext {
            connection_id,
            direction: Direction::TargetToClient,
            engine: Arc::clone(&config.engine),
            ledger: config.ledger.clone(),
            stream_id,
            client_ip: peer.ip(),
            target_port: config.target_addr.port(),
        },
        cancel.clone(),
    ));

    let _ = tokio::join!(client_to_target, target_to_client);

    config.ledger.close_stream(stream_id).await;
    tracing::info!(%connection_id, %peer, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_audit::{AlertLevel, StreamId};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Bind an ephemeral listener, spawn the relay on it, and return its
    /// address together with the ledger used for assertions.
    async fn start_relay(
        rules: &[(&str, &str)],
        target: SocketAddr,
    ) -> (SocketAddr, FlowLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in rules {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let engine = Arc::new(RuleEngine::new(dir.path()));
        engine.reload().unwrap();

        let ledger = FlowLedger::new(Duration::from_secs(30));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = Relay::new(RelayConfig {
            listen_addr: addr,
            target_addr: target,
            engine,
            ledger: ledger.clone(),
        });
        tokio::spawn(async move {
            let _ = relay.serve(listener).await;
        });

        (addr, ledger, dir)
    }

    /// Backend that accepts one connection and records everything it
    /// receives until EOF, without responding.
    async fn silent_backend() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
            received
        });
        (addr, handle)
    }

    /// Backend that echoes every byte straight back.
    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        addr
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn allowed_traffic_is_forwarded_byte_for_byte() {
        let request = b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping";
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while received.len() < request.len() {
                let n = sock.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "backend saw EOF before the full request");
                received.extend_from_slice(&buf[..n]);
            }
            sock.write_all(response).await.unwrap();
            received
        });

        let (relay_addr, _ledger, _rules) = start_relay(&[], backend_addr).await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        while got.len() < response.len() {
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "client saw EOF before the full response");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, response);

        drop(client);
        assert_eq!(backend.await.unwrap(), request);
    }

    #[tokio::test]
    async fn blocked_request_reaches_neither_side() {
        let (backend_addr, backend) = silent_backend().await;
        let (relay_addr, ledger, _rules) = start_relay(
            &[("block_bad.rule", "if path contains \"bad\" { drop() }")],
            backend_addr,
        )
        .await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client
            .write_all(b"GET /bad HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        // The client sees a silent close: no response bytes, just EOF.
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected silent close, got {n} bytes");

        // Not a single byte reached the backend.
        assert!(backend.await.unwrap().is_empty());

        // The session was escalated to blocked.
        eventually(|| {
            ledger
                .session_of(StreamId(1))
                .and_then(|session| ledger.alert_level(session))
                == Some(AlertLevel::Blocked)
        })
        .await;
    }

    #[tokio::test]
    async fn split_request_is_reconstructed_and_forwarded() {
        let head = b"POST /split HTTP/1.1\r\nContent-Length: 4\r\n\r\n";
        let body = b"test";

        let (backend_addr, backend) = silent_backend().await;
        let (relay_addr, _ledger, _rules) = start_relay(&[], backend_addr).await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(body).await.unwrap();
        drop(client);

        let mut expected = head.to_vec();
        expected.extend_from_slice(body);
        assert_eq!(backend.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn pipelined_request_behind_a_block_is_held_back() {
        let allowed = b"GET /ok HTTP/1.1\r\n\r\n".to_vec();
        let mut combined = allowed.clone();
        combined.extend_from_slice(b"GET /bad HTTP/1.1\r\n\r\n");

        let (backend_addr, backend) = silent_backend().await;
        let (relay_addr, _ledger, _rules) = start_relay(
            &[("block_bad.rule", "if path contains \"bad\" { drop() }")],
            backend_addr,
        )
        .await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&combined).await.unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected silent close after the blocked request");

        // Only the approved request's bytes were forwarded; the dropped one
        // never rode along.
        assert_eq!(backend.await.unwrap(), allowed);
    }

    #[tokio::test]
    async fn non_http_traffic_passes_through_raw() {
        let backend_addr = echo_backend().await;
        let (relay_addr, _ledger, _rules) = start_relay(&[], backend_addr).await;

        let junk = b"\x00\x01\x02raw bytes, not http\xff\xfe";
        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(junk).await.unwrap();

        let mut got = vec![0u8; junk.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, junk);
    }

    #[tokio::test]
    async fn oversized_unparseable_head_degrades_to_passthrough() {
        let backend_addr = echo_backend().await;
        let (relay_addr, _ledger, _rules) = start_relay(&[], backend_addr).await;

        // A request line that never terminates: stays Partial forever, so the
        // parse window flushes it raw instead of stalling the connection.
        let mut blob = b"GET /".to_vec();
        blob.extend(std::iter::repeat_n(b'a', 6000));

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(&blob).await.unwrap();

        let mut got = vec![0u8; blob.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, blob);
    }

    #[tokio::test]
    async fn unreachable_upstream_closes_the_inbound_connection() {
        // Bind and immediately drop a listener to get an address that
        // refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let (relay_addr, _ledger, _rules) = start_relay(&[], dead_addr).await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "inbound side must be closed without data");
    }

    #[tokio::test]
    async fn responses_are_logged_but_never_evaluated() {
        // A global drop-everything rule must not touch the response path.
        let request = b"GET /ok HTTP/1.1\r\n\r\n";
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let mut seen = 0;
            while seen < request.len() {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                seen += n;
            }
            sock.write_all(response).await.unwrap();
        });

        // Rule only drops requests whose path contains "nomatch"; the
        // response body containing "ok" must not be inspected at all.
        let (relay_addr, _ledger, _rules) = start_relay(
            &[("irrelevant.rule", "if path contains \"nomatch\" { drop() }")],
            backend_addr,
        )
        .await;

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut got = vec![0u8; response.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, response);
    }
}
