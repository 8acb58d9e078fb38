//! Relay Session

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{RelaySettings, ServerTarget};
use crate::modules::{Direction, Dispatch, ModuleRegistry};

/// Lifecycle of a single relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client accepted, upstream connect in flight; no bytes relayed
    Connecting,
    Relaying,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Either side closed its connection
    Disconnected,
    ConnectFailed(io::Error),
    ClientError(io::Error),
    UpstreamError(io::Error),
}

/// Totals reported when a session is torn down
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: Option<SocketAddr>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
    pub end: SessionEnd,
}

/// One client connection relayed to its game server
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target: ServerTarget,
    state: SessionState,
    dispatch: Dispatch,
    start_time: Instant,
}

impl RelaySession {
    /// Create a session with every registered module attached
    pub fn new(client_addr: SocketAddr, target: ServerTarget, modules: &ModuleRegistry) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut dispatch = Dispatch::new();
        dispatch.load_all(modules);

        debug!(
            "Creating relay session {} ({} -> {}) with {} module(s)",
            session_id,
            client_addr,
            target,
            modules.len()
        );

        Self {
            session_id,
            client_addr,
            target,
            state: SessionState::Connecting,
            dispatch,
            start_time: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Connect upstream and relay until either side disconnects
    pub async fn run(mut self, client: TcpStream, settings: &RelaySettings) -> SessionSummary {
        let mut client = client;

        let mut upstream = match self.connect(settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    "Failed to connect {} to {}: {}",
                    self.client_addr,
                    self.target,
                    e
                );
                return self.close(None, 0, 0, SessionEnd::ConnectFailed(e));
            }
        };

        if let Err(e) = upstream.set_nodelay(true) {
            debug!("Failed to disable Nagle on upstream socket: {}", e);
        }
        let upstream_addr = upstream.peer_addr().ok();

        info!(
            "[connection] routing {} to {}",
            self.client_addr,
            upstream_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.target.to_string())
        );
        self.state = SessionState::Relaying;

        let mut bytes_up = 0u64;
        let mut bytes_down = 0u64;
        let end = {
            let (mut client_rd, mut client_wr) = client.split();
            let (mut upstream_rd, mut upstream_wr) = upstream.split();
            let dispatch = &self.dispatch;
            let session_id = self.session_id.as_str();

            let downstream = pump(
                &mut upstream_rd,
                &mut client_wr,
                dispatch,
                session_id,
                Direction::ServerToClient,
                settings.buffer_size,
                &mut bytes_down,
            );
            let upstream_leg = pump(
                &mut client_rd,
                &mut upstream_wr,
                dispatch,
                session_id,
                Direction::ClientToServer,
                settings.buffer_size,
                &mut bytes_up,
            );

            tokio::select! {
                result = downstream => match result {
                    Ok(()) => SessionEnd::Disconnected,
                    Err(PumpError::Read(e)) => SessionEnd::UpstreamError(e),
                    Err(PumpError::Write(e)) => SessionEnd::ClientError(e),
                },
                result = upstream_leg => match result {
                    Ok(()) => SessionEnd::Disconnected,
                    Err(PumpError::Read(e)) => SessionEnd::ClientError(e),
                    Err(PumpError::Write(e)) => SessionEnd::UpstreamError(e),
                },
            }
        };

        match &end {
            SessionEnd::Disconnected => {}
            SessionEnd::ClientError(e)
            | SessionEnd::UpstreamError(e)
            | SessionEnd::ConnectFailed(e) => {
                warn!(session_id = %self.session_id, "Socket error: {}", e);
            }
        }

        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;
        self.close(upstream_addr, bytes_up, bytes_down, end)
    }

    async fn connect(&self, connect_timeout: Duration) -> io::Result<TcpStream> {
        let target = (self.target.host.as_str(), self.target.port);
        match timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", connect_timeout),
            )),
        }
    }

    fn close(
        mut self,
        upstream_addr: Option<SocketAddr>,
        bytes_up: u64,
        bytes_down: u64,
        end: SessionEnd,
    ) -> SessionSummary {
        self.state = SessionState::Closed;
        let duration = self.start_time.elapsed();

        info!("[connection] {} disconnected", self.client_addr);
        debug!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            target = %self.target,
            duration_ms = duration.as_millis() as u64,
            bytes_up,
            bytes_down,
            "Relay session closed"
        );

        SessionSummary {
            session_id: self.session_id,
            client_addr: self.client_addr,
            upstream_addr,
            bytes_up,
            bytes_down,
            duration,
            end,
        }
    }
}

enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

/// Copy one direction through the module pipeline until EOF
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    dispatch: &Dispatch,
    session_id: &str,
    direction: Direction,
    buffer_size: usize,
    transferred: &mut u64,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.clear();
        buf.reserve(buffer_size);

        let n = reader.read_buf(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        *transferred += n as u64;

        dispatch.handle(session_id, direction, &mut buf);
        if !buf.is_empty() {
            writer.write_all(&buf).await.map_err(PumpError::Write)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings() -> RelaySettings {
        RelaySettings {
            connect_timeout: Duration::from_secs(2),
            buffer_size: 4096,
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_session_starts_connecting_with_modules() {
        let target = ServerTarget::new("1", "127.0.0.1", 1);
        let registry = ModuleRegistry::new();
        let session = RelaySession::new("127.0.0.1:5000".parse().unwrap(), target, &registry);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.dispatch().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_session() {
        // grab a free port and release it so the connect is refused
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (client_side, accepted) = pair().await;
        let target = ServerTarget::new("1", "127.0.0.1", port);
        let client_addr = accepted.peer_addr().unwrap();
        let session = RelaySession::new(client_addr, target, &ModuleRegistry::new());

        let summary = session.run(accepted, &settings()).await;
        assert!(matches!(summary.end, SessionEnd::ConnectFailed(_)));
        assert_eq!(summary.bytes_up, 0);
        drop(client_side);
    }

    #[tokio::test]
    async fn test_relays_both_directions_until_upstream_closes() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"world").await.unwrap();
            buf
        });

        let (mut client_side, accepted) = pair().await;
        let target = ServerTarget::new("1", "127.0.0.1", upstream_addr.port());
        let client_addr = accepted.peer_addr().unwrap();
        let session = RelaySession::new(client_addr, target, &ModuleRegistry::new());
        let relay = tokio::spawn(async move { session.run(accepted, &settings()).await });

        client_side.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
        assert_eq!(&server.await.unwrap(), b"hello");

        let summary = relay.await.unwrap();
        assert!(matches!(summary.end, SessionEnd::Disconnected));
        assert_eq!(summary.bytes_up, 5);
        assert_eq!(summary.bytes_down, 5);
    }

    struct Blackhole;

    impl crate::modules::Interceptor for Blackhole {
        fn intercept(&self, _session_id: &str, _direction: Direction, chunk: &mut BytesMut) {
            chunk.clear();
        }
    }

    #[tokio::test]
    async fn test_pump_copies_until_eof() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut writer = tokio_test::io::Builder::new()
            .write(b"hello ")
            .write(b"world")
            .build();

        let mut transferred = 0;
        let result = pump(
            &mut reader,
            &mut writer,
            &Dispatch::new(),
            "test",
            Direction::ClientToServer,
            64,
            &mut transferred,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(transferred, 11);
    }

    #[tokio::test]
    async fn test_pump_skips_emptied_chunks() {
        let mut dispatch = Dispatch::new();
        dispatch.load(
            "blackhole",
            std::sync::Arc::new(crate::modules::ModuleDefinition::from_interceptor(
                "blackhole", Blackhole,
            )),
        );

        let mut reader = tokio_test::io::Builder::new().read(b"secret").build();
        // Any write to this mock fails the test
        let mut writer = tokio_test::io::Builder::new().build();

        let mut transferred = 0;
        let result = pump(
            &mut reader,
            &mut writer,
            &dispatch,
            "test",
            Direction::ServerToClient,
            64,
            &mut transferred,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(transferred, 6);
    }
}
