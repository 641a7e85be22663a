/// Frontend client connections and startup handling
///
/// Carries a client connection from accept to a validated identity: the v3
/// startup message (with the SSL probe answered and cancel requests
/// flagged), a trivial AuthenticationOk exchange and the initial
/// ReadyForQuery. Everything past that point is the session state machine.
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PorteroError, PorteroResult};
use crate::protocol::{self, Message};
use crate::utils::generate_id;

/// v3 protocol version number (3.0)
const PROTOCOL_V3: u32 = 196608;
/// Magic request code for a cancel-request packet
const CANCEL_REQUEST_CODE: u32 = 80877102;
/// Magic request code for an SSL negotiation probe
const SSL_REQUEST_CODE: u32 = 80877103;
/// Sanity cap on the startup packet
const MAX_STARTUP_SIZE: usize = 10 * 1024;

/// Validated client identity produced by the startup exchange
#[derive(Debug, Clone, Default)]
pub struct StartupIdentity {
    pub database: String,
    pub user: String,
    pub is_cancel: bool,
}

/// A single front-end client connection
#[derive(Debug)]
pub struct ClientConnection {
    pub id: String,
    pub addr: SocketAddr,
    pub stream: TcpStream,
    pub startup: StartupIdentity,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            id: generate_id("client"),
            addr,
            stream,
            startup: StartupIdentity::default(),
        }
    }

    /// Run the startup exchange and populate the client identity.
    ///
    /// Answers the SSL probe with 'N' (no TLS termination here) and re-reads,
    /// flags cancel requests without parsing parameters, and otherwise
    /// requires a v3 StartupMessage carrying at least a user name. The
    /// database name defaults to the user name when absent.
    pub async fn startup(&mut self) -> PorteroResult<()> {
        loop {
            let (code, body) = self.read_startup_packet().await?;
            match code {
                SSL_REQUEST_CODE => {
                    debug!("C: ssl probe from {}, answering 'N'", self.addr);
                    self.stream.write_all(b"N").await?;
                    self.stream.flush().await?;
                }
                CANCEL_REQUEST_CODE => {
                    self.startup = StartupIdentity {
                        is_cancel: true,
                        ..Default::default()
                    };
                    return Ok(());
                }
                PROTOCOL_V3 => {
                    self.startup = parse_startup_parameters(&body)?;
                    debug!(
                        "C: startup from {} for database '{}' user '{}'",
                        self.addr, self.startup.database, self.startup.user
                    );
                    return Ok(());
                }
                other => {
                    return Err(PorteroError::protocol(format!(
                        "unsupported startup request code {}",
                        other
                    )))
                }
            }
        }
    }

    async fn read_startup_packet(&mut self) -> PorteroResult<(u32, Vec<u8>)> {
        let len = self.stream.read_u32().await? as usize;
        if len < 8 || len > MAX_STARTUP_SIZE {
            return Err(PorteroError::protocol(format!(
                "startup packet length {} out of bounds",
                len
            )));
        }
        let code = self.stream.read_u32().await?;
        let mut body = vec![0u8; len - 8];
        self.stream.read_exact(&mut body).await?;
        Ok((code, body))
    }

    /// Send AuthenticationOk. Real authentication methods are not
    /// implemented; the pooler trusts its network boundary.
    pub async fn auth_ok(&mut self) -> PorteroResult<()> {
        let message = Message::new(b'R', 0u32.to_be_bytes().to_vec());
        protocol::write_message(&mut self.stream, &message).await?;
        Ok(())
    }

    /// Notify the client we are ready for its first request
    pub async fn ready(&mut self) -> PorteroResult<()> {
        protocol::write_message(&mut self.stream, &Message::ready_for_query()).await?;
        Ok(())
    }
}

/// Parse the NUL-separated key/value parameter list of a StartupMessage
fn parse_startup_parameters(body: &[u8]) -> PorteroResult<StartupIdentity> {
    let mut user = None;
    let mut database = None;

    let mut fields = body.split(|b| *b == 0);
    loop {
        let Some(key) = fields.next() else { break };
        if key.is_empty() {
            // Terminator of the parameter list.
            break;
        }
        let Some(value) = fields.next() else {
            return Err(PorteroError::protocol(
                "startup parameter without a value".to_string(),
            ));
        };

        let key = String::from_utf8_lossy(key);
        let value = String::from_utf8_lossy(value).into_owned();
        match key.as_ref() {
            "user" => user = Some(value),
            "database" => database = Some(value),
            // options, application_name etc. are irrelevant for routing
            _ => {}
        }
    }

    let Some(user) = user else {
        return Err(PorteroError::protocol(
            "startup packet is missing the user parameter".to_string(),
        ));
    };
    let database = database.unwrap_or_else(|| user.clone());

    Ok(StartupIdentity {
        database,
        user,
        is_cancel: false,
    })
}
