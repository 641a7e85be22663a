/// Portero - a lightweight PostgreSQL connection pooler and request router
///
/// Portero multiplexes many front-end client connections onto a smaller,
/// reusable set of back-end server connections. Each accepted client runs
/// one task: startup and auth, route resolution against the configured
/// schemes, a server lease from the route's pool, then the bidirectional
/// message pump until the session ends and the cleanup policy decides
/// whether the server connection is recycled or discarded.
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{route_session, ClientConnection, RoutePool};
use crate::error::{PorteroError, PorteroResult};
use crate::utils::format_duration;

/// Main pooler instance: the compiled configuration plus the route registry
pub struct Portero {
    config: Config,
    routes: Arc<RoutePool>,
    limiter: Arc<Semaphore>,
}

impl Portero {
    pub fn new(config: Config) -> PorteroResult<Self> {
        config.validate()?;
        let schemes = Arc::new(config.scheme_set()?);
        if schemes.is_empty() {
            warn!("no routes configured, every session will fail routing");
        }
        let connect_timeout = Duration::from_secs(config.server.connect_timeout_sec);
        let limiter = Arc::new(Semaphore::new(config.server.max_connections));
        Ok(Self {
            routes: Arc::new(RoutePool::new(schemes, connect_timeout)),
            limiter,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the route registry (shared with all running sessions)
    pub fn routes(&self) -> Arc<RoutePool> {
        Arc::clone(&self.routes)
    }

    /// Bind the configured listen address and serve forever
    pub async fn run(self: Arc<Self>) -> PorteroResult<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        info!("listening on {}", self.config.server.listen_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    ///
    /// One tokio task per accepted connection; the semaphore enforces the
    /// configured connection cap by dropping clients above it. Transient
    /// accept failures (aborted handshakes, descriptor exhaustion) must
    /// not take down running sessions, so they are logged and the loop
    /// continues.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> PorteroResult<()> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    let error = PorteroError::from(e);
                    if error.is_recoverable() {
                        warn!("C: accept failed: {}, continuing", error);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    return Err(error);
                }
            };

            let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() else {
                warn!("C: connection from {} dropped, at max_connections", addr);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!("C: failed to set nodelay for {}: {}", addr, e);
            }

            let routes = Arc::clone(&self.routes);
            tokio::spawn(async move {
                handle_client(stream, addr, routes).await;
                drop(permit);
            });
        }
    }
}

/// Per-connection task: startup, auth, ready notification, then the
/// session state machine. The client connection closes when this returns.
async fn handle_client(stream: TcpStream, addr: SocketAddr, routes: Arc<RoutePool>) {
    let started = Instant::now();
    let mut client = ClientConnection::new(stream, addr);
    debug!("C: new connection from {}", addr);

    if let Err(e) = client.startup().await {
        warn!("C: startup with {} failed: {}", addr, e);
        return;
    }
    if client.startup.is_cancel {
        debug!("C: cancel request from {}", addr);
        return;
    }
    if let Err(e) = client.auth_ok().await {
        warn!("C: auth exchange with {} failed: {}", addr, e);
        return;
    }
    if let Err(e) = client.ready().await {
        warn!("C: ready notification to {} failed: {}", addr, e);
        return;
    }

    let outcome = route_session(&mut client, &routes).await;
    info!(
        "C: session from {} finished: {} after {}",
        addr,
        outcome,
        format_duration(started.elapsed())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolingMode, RouteSchemeConfig};
    use crate::protocol::{self, Message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Scripted backend: answers every request with one DataRow-ish message
    /// and a ReadyForQuery
    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    loop {
                        let Ok(message) = protocol::read_message(&mut stream).await else {
                            break;
                        };
                        if message.is_terminate() {
                            break;
                        }
                        let data = Message::new(b'D', b"row".to_vec());
                        if protocol::write_message(&mut stream, &data).await.is_err() {
                            break;
                        }
                        let ready = Message::ready_for_query();
                        if protocol::write_message(&mut stream, &ready).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_config(backend: SocketAddr, max_connections: usize) -> Config {
        let mut config = Config {
            routes: vec![RouteSchemeConfig {
                database: "app".to_string(),
                forced_database: None,
                forced_user: None,
                server_addr: backend.to_string(),
                pooling_mode: PoolingMode::Session,
                pool_size: 4,
                default: false,
            }],
            ..Default::default()
        };
        config.server.max_connections = max_connections;
        config
    }

    async fn spawn_portero(config: Config) -> (Arc<Portero>, SocketAddr) {
        let portero = Arc::new(Portero::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&portero).serve(listener));
        (portero, addr)
    }

    fn startup_packet(user: &str, database: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (key, value) in [("user", user), ("database", database)] {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut packet = Vec::new();
        packet.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        packet.extend_from_slice(&196608u32.to_be_bytes());
        packet.extend_from_slice(&body);
        packet
    }

    #[tokio::test]
    async fn test_full_session_round_trip() {
        let backend = spawn_backend().await;
        let (portero, addr) = spawn_portero(test_config(backend, 16)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&startup_packet("alice", "app"))
            .await
            .unwrap();

        let auth = protocol::read_message(&mut client).await.unwrap();
        assert_eq!(auth.tag, b'R');
        let ready = protocol::read_message(&mut client).await.unwrap();
        assert!(ready.is_ready_for_query());

        let query = Message::new(b'Q', b"SELECT 1\0".to_vec());
        protocol::write_message(&mut client, &query).await.unwrap();

        let data = protocol::read_message(&mut client).await.unwrap();
        assert_eq!(data.tag, b'D');
        let ready = protocol::read_message(&mut client).await.unwrap();
        assert!(ready.is_ready_for_query());

        protocol::write_message(&mut client, &Message::terminate())
            .await
            .unwrap();

        // The front-end connection is closed at session end.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        // The server connection went back to the idle pool.
        let route = portero.routes().resolve("app", "alice").await.unwrap();
        assert_eq!(route.pool.idle_count(), 1);
        assert_eq!(route.pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_database_closes_client() {
        let backend = spawn_backend().await;
        let (portero, addr) = spawn_portero(test_config(backend, 16)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&startup_packet("alice", "nope"))
            .await
            .unwrap();

        let auth = protocol::read_message(&mut client).await.unwrap();
        assert_eq!(auth.tag, b'R');
        let ready = protocol::read_message(&mut client).await.unwrap();
        assert!(ready.is_ready_for_query());

        // Routing fails and the connection closes; no server was touched.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(portero.routes().route_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_request_closes_without_auth() {
        let backend = spawn_backend().await;
        let (_portero, addr) = spawn_portero(test_config(backend, 16)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(&16u32.to_be_bytes());
        packet.extend_from_slice(&80877102u32.to_be_bytes());
        packet.extend_from_slice(&42u32.to_be_bytes());
        packet.extend_from_slice(&7u32.to_be_bytes());
        client.write_all(&packet).await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_survives_aborted_connection() {
        let backend = spawn_backend().await;
        let (_portero, addr) = spawn_portero(test_config(backend, 16)).await;

        // Abort the handshake: linger of zero turns the close into a RST,
        // which can surface as an accept-time error.
        let aborted = TcpStream::connect(addr).await.unwrap();
        aborted.set_linger(Some(Duration::ZERO)).unwrap();
        drop(aborted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The accept loop is still alive and serves a full handshake.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&startup_packet("alice", "app"))
            .await
            .unwrap();
        let auth = protocol::read_message(&mut client).await.unwrap();
        assert_eq!(auth.tag, b'R');
        let ready = protocol::read_message(&mut client).await.unwrap();
        assert!(ready.is_ready_for_query());
    }

    #[tokio::test]
    async fn test_connection_cap_drops_excess_clients() {
        let backend = spawn_backend().await;
        let (_portero, addr) = spawn_portero(test_config(backend, 1)).await;

        // First client occupies the only slot by idling in startup.
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
    }
}
