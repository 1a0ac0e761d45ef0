//! Line-oriented duplex TCP transport (spec §4.6).
//!
//! Server side: on accept, write `READY\n`, then read lines. `PING` gets a
//! bare `PONG\n` (the health-check path, used by the failure detector).
//! Anything else is an application message: invoke the handler, reply
//! `ACK\n`, and keep reading until EOF or the line `EXIT`.
//!
//! Client side: [`send_ping`] for health checks (no `READY` consumed);
//! [`send_message`] consumes `READY`, sends one line, and expects `ACK`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PING: &str = "PING";
const PONG: &str = "PONG\n";
const READY: &str = "READY\n";
const ACK: &str = "ACK\n";
const EXIT: &str = "EXIT";

/// Invoked once per application-level line received by the server.
pub trait MessageHandler: Send + Sync {
    /// `line` is the raw content sent by the client, already stripped of its
    /// trailing newline.
    fn handle(&self, line: &str);
}

/// A running transport server. Dropping or calling [`TransportServer::stop`]
/// tears down the accept loop; in-flight connections are left to finish or
/// hit their own I/O errors (no locks are held across network I/O — spec
/// §5).
pub struct TransportServer {
    accept_task: JoinHandle<()>,
}

impl TransportServer {
    /// Binds `addr` and starts the accept loop, spawning one task per
    /// connected client (spec §5 "one thread per connected client").
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn MessageHandler>,
    ) -> io::Result<(Self, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(socket, handler.as_ref()).await {
                        // Connection resets from health probes are routine
                        // and not worth logging above debug (spec §7).
                        if is_routine_disconnect(&err) {
                            debug!(peer = %peer_addr, "client disconnected");
                        } else {
                            warn!(peer = %peer_addr, error = %err, "connection error");
                        }
                    }
                });
            }
        });

        Ok((Self { accept_task }, local_addr))
    }

    /// Stops accepting new connections.
    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

fn is_routine_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
    )
}

async fn serve_connection(socket: TcpStream, handler: &dyn MessageHandler) -> io::Result<()> {
    let mut reader = BufReader::new(socket);
    reader.get_mut().write_all(READY.as_bytes()).await?;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(()); // EOF
        }
        let line = line.trim_end_matches(['\n', '\r']);

        if line.eq_ignore_ascii_case(PING) {
            reader.get_mut().write_all(PONG.as_bytes()).await?;
            continue;
        }

        if line == EXIT {
            return Ok(());
        }

        handler.handle(line);
        reader.get_mut().write_all(ACK.as_bytes()).await?;
    }
}

/// Client-side health check: connect, send `PING`, expect `PONG` (no
/// `READY` is consumed on this path — spec §4.6/§4.3).
pub async fn send_ping(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<bool> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr)).await??;
    stream.write_all(format!("{PING}\n").as_bytes()).await?;

    let mut reader = BufReader::new(&mut stream);
    let mut reply = String::new();
    tokio::time::timeout(timeout, reader.read_line(&mut reply)).await??;

    Ok(reply.trim().eq_ignore_ascii_case("PONG"))
}

/// Client-side message send: connect, consume `READY`, send `content`,
/// expect `ACK` (spec §4.6, used by a follower forwarding to the leader).
pub async fn send_message(
    addr: impl ToSocketAddrs,
    content: &str,
    timeout: Duration,
) -> io::Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr)).await??;
    let mut reader = BufReader::new(stream);

    let mut greeting = String::new();
    tokio::time::timeout(timeout, reader.read_line(&mut greeting)).await??;

    reader
        .get_mut()
        .write_all(format!("{content}\n").as_bytes())
        .await?;

    let mut reply = String::new();
    tokio::time::timeout(timeout, reader.read_line(&mut reply)).await??;

    if reply.trim().eq_ignore_ascii_case("ACK") {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidData, "expected ACK"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        received: Mutex<Vec<String>>,
    }

    impl MessageHandler for RecordingHandler {
        fn handle(&self, line: &str) {
            self.received.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn health_check_round_trip() {
        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let (server, addr) = TransportServer::bind("127.0.0.1:0", handler).await.unwrap();

        let ok = send_ping(addr, Duration::from_millis(500)).await.unwrap();
        assert!(ok);

        server.stop();
    }

    #[tokio::test]
    async fn message_round_trip_invokes_handler_and_acks() {
        let handler = Arc::new(RecordingHandler {
            received: Mutex::new(Vec::new()),
        });
        let (server, addr) = TransportServer::bind("127.0.0.1:0", Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .await
            .unwrap();

        send_message(addr, "hello", Duration::from_millis(500)).await.unwrap();

        // Give the spawned connection task a moment to invoke the handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.received.lock().unwrap().as_slice(), ["hello"]);

        server.stop();
    }
}
