/// Backend server connections and the per-route server pool
///
/// A `ServerPool` owns every backend connection for one route. Callers get
/// exclusive use of a connection through a `ServerLease` and must end the
/// lease with exactly one of `reset` (recycle into the idle set) or `close`
/// (tear the transport down). A lease dropped without either is closed and
/// logged, so a leaked connection can never linger in a half-returned state.
///
/// Pool state lives behind a plain `std::sync::Mutex`: every critical
/// section is a short pop/push with no await inside, and the lease guard's
/// `Drop` needs to touch the state without an executor.
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::utils::generate_id;

/// Lifecycle state of a single backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Parked in the pool, safe to lease
    Idle,
    /// Exclusively leased to one client session
    Active,
    /// Transport torn down, connection is gone
    Closed,
}

/// A single backend server connection
#[derive(Debug)]
pub struct ServerConnection {
    pub id: String,
    pub addr: SocketAddr,
    pub stream: TcpStream,
    pub state: ServerState,
}

/// Why an acquisition attempt failed
///
/// The session layer folds both variants into `PoolExhausted`; the
/// distinction only matters for logging.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("pool at capacity ({0} servers leased)")]
    AtCapacity(usize),

    #[error("backend connect failed: {0}")]
    Connect(#[from] io::Error),
}

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<ServerConnection>,
    leased: usize,
}

/// Per-route pool of backend server connections
#[derive(Debug)]
pub struct ServerPool {
    target: SocketAddr,
    max_size: usize,
    connect_timeout: Duration,
    state: Arc<Mutex<PoolState>>,
}

impl ServerPool {
    pub fn new(target: SocketAddr, max_size: usize, connect_timeout: Duration) -> Self {
        Self {
            target,
            max_size,
            connect_timeout,
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: 0,
            })),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Lease a server connection for exclusive use.
    ///
    /// Prefers an idle connection over dialing a new one. Fails fast when
    /// the pool is at capacity rather than queueing the caller.
    pub async fn acquire(&self) -> Result<ServerLease, AcquireError> {
        {
            let mut state = self.state.lock().expect("server pool lock poisoned");
            if let Some(mut server) = state.idle.pop_front() {
                server.state = ServerState::Active;
                state.leased += 1;
                debug!("S: reusing idle server {} for {}", server.id, self.target);
                return Ok(ServerLease::new(server, Arc::clone(&self.state)));
            }
            if state.leased >= self.max_size {
                return Err(AcquireError::AtCapacity(state.leased));
            }
            // Reserve the slot before connecting so concurrent acquirers
            // cannot overshoot the cap while we are dialing.
            state.leased += 1;
        }

        match self.connect().await {
            Ok(server) => Ok(ServerLease::new(server, Arc::clone(&self.state))),
            Err(e) => {
                let mut state = self.state.lock().expect("server pool lock poisoned");
                state.leased -= 1;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<ServerConnection, AcquireError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(AcquireError::Connect(e)),
            Err(_) => {
                return Err(AcquireError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.target),
                )))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("S: failed to set nodelay on {}: {}", self.target, e);
        }

        let server = ServerConnection {
            id: generate_id("server"),
            addr: self.target,
            stream,
            state: ServerState::Active,
        };
        debug!("S: established new server {} to {}", server.id, self.target);
        Ok(server)
    }

    /// Number of idle connections parked in the pool
    pub fn idle_count(&self) -> usize {
        self.state
            .lock()
            .expect("server pool lock poisoned")
            .idle
            .len()
    }

    /// Number of connections currently leased out
    pub fn leased_count(&self) -> usize {
        self.state.lock().expect("server pool lock poisoned").leased
    }
}

/// Exclusive lease on one backend server connection.
///
/// Must end in exactly one of `reset` or `close`. Dropping the lease
/// without choosing closes the connection and logs a warning.
#[must_use = "a leased server must be released via reset() or close()"]
#[derive(Debug)]
pub struct ServerLease {
    server: Option<ServerConnection>,
    pool: Arc<Mutex<PoolState>>,
}

impl ServerLease {
    fn new(server: ServerConnection, pool: Arc<Mutex<PoolState>>) -> Self {
        Self {
            server: Some(server),
            pool,
        }
    }

    pub fn server(&self) -> &ServerConnection {
        self.server.as_ref().expect("lease already released")
    }

    pub fn server_mut(&mut self) -> &mut ServerConnection {
        self.server.as_mut().expect("lease already released")
    }

    /// Return the connection to the idle set for reuse.
    ///
    /// Only valid when the protocol stream is known to sit on a message
    /// boundary (graceful client terminate, or a client-side failure that
    /// never touched the server's framing).
    pub fn reset(mut self) {
        let Some(mut server) = self.server.take() else {
            return;
        };
        server.state = ServerState::Idle;
        debug!("S: server {} reset to idle pool", server.id);

        let mut state = self.pool.lock().expect("server pool lock poisoned");
        state.leased -= 1;
        state.idle.push_back(server);
    }

    /// Tear down the connection and discard it permanently.
    ///
    /// Required after any server-side read/write failure, since the
    /// transport can no longer be trusted to be message-aligned.
    pub fn close(mut self) {
        let Some(mut server) = self.server.take() else {
            return;
        };
        server.state = ServerState::Closed;
        debug!("S: server {} closed and discarded", server.id);

        let mut state = self.pool.lock().expect("server pool lock poisoned");
        state.leased -= 1;
        // Dropping the connection closes the transport.
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        warn!(
            "S: lease on server {} dropped without reset or close, closing it",
            server.id
        );
        if let Ok(mut state) = self.pool.lock() {
            state.leased -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Backend stub that accepts connections and holds them open
    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn pool(addr: SocketAddr, max_size: usize) -> ServerPool {
        ServerPool::new(addr, max_size, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_acquire_establishes_connection() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 4);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.server().state, ServerState::Active);
        assert_eq!(pool.leased_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        lease.reset();
        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_prefers_idle_server() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 4);

        let lease = pool.acquire().await.unwrap();
        let first_id = lease.server().id.clone();
        lease.reset();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.server().id, first_id);
        assert_eq!(pool.idle_count(), 0);
        lease.reset();
    }

    #[tokio::test]
    async fn test_acquire_at_capacity_fails() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 1);

        let lease = pool.acquire().await.unwrap();
        let second = pool.acquire().await;
        assert!(matches!(second, Err(AcquireError::AtCapacity(1))));

        // Releasing frees the slot again.
        lease.reset();
        let lease = pool.acquire().await.unwrap();
        lease.reset();
    }

    #[tokio::test]
    async fn test_close_discards_connection() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 2);

        let lease = pool.acquire().await.unwrap();
        lease.close();
        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Bind then drop, so the port is very likely unoccupied.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool(addr, 2);
        let result = pool.acquire().await;
        assert!(matches!(result, Err(AcquireError::Connect(_))));
        // The reserved slot must have been given back.
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_connection() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 2);

        let lease = pool.acquire().await.unwrap();
        drop(lease);

        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_lease_exclusivity() {
        let addr = spawn_backend().await;
        let pool = pool(addr, 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        // Two concurrent leases must be distinct connections.
        assert_ne!(first.server().id, second.server().id);

        first.reset();
        second.reset();
        assert_eq!(pool.idle_count(), 2);
    }
}
