/// The per-client session state machine
///
/// `route_session` is the entry point run for every authenticated client:
/// resolve a route, lease a server from its pool, then pump protocol
/// messages both ways until the session terminates. The outcome drives the
/// cleanup policy — client-side failures never implicate the server's
/// protocol state so the server is recycled, while server-side failures
/// leave its framing unverifiable so the connection is discarded.
use std::fmt;
use tracing::{error, info, trace, warn};

use crate::config::PoolingMode;
use crate::core::backend::ServerLease;
use crate::core::frontend::ClientConnection;
use crate::core::route::RoutePool;
use crate::protocol;

/// Terminal result of one client session.
///
/// Every session ends in exactly one of these; the cleanup table consumes
/// each value exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Client terminated gracefully
    Ok,
    /// No route scheme matched and no default is configured
    RouteNotFound,
    /// No server could be leased (pool at capacity or connect failure)
    PoolExhausted,
    /// The route's pooling mode has no defined behavior
    UnsupportedMode,
    /// Reading from the client failed
    ClientReadError,
    /// Writing to the client failed
    ClientWriteError,
    /// Reading from the server failed
    ServerReadError,
    /// Writing to the server failed
    ServerWriteError,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionOutcome::Ok => "ok",
            SessionOutcome::RouteNotFound => "route-not-found",
            SessionOutcome::PoolExhausted => "pool-exhausted",
            SessionOutcome::UnsupportedMode => "unsupported-mode",
            SessionOutcome::ClientReadError => "client-read-error",
            SessionOutcome::ClientWriteError => "client-write-error",
            SessionOutcome::ServerReadError => "server-read-error",
            SessionOutcome::ServerWriteError => "server-write-error",
        };
        write!(f, "{}", name)
    }
}

/// Run one client session to completion and apply the cleanup policy.
///
/// The front-end connection itself is closed by the caller dropping the
/// `ClientConnection`; only the leased server's fate differs by outcome.
pub async fn route_session(client: &mut ClientConnection, routes: &RoutePool) -> SessionOutcome {
    let (outcome, lease) = run_session(client, routes).await;

    // Outcome -> cleanup table. Exhaustive over the closed enum: adding an
    // outcome without deciding its cleanup must not compile.
    match outcome {
        SessionOutcome::RouteNotFound
        | SessionOutcome::PoolExhausted
        | SessionOutcome::UnsupportedMode => {
            debug_assert!(lease.is_none(), "no server may be leased before forwarding");
        }
        SessionOutcome::Ok
        | SessionOutcome::ClientReadError
        | SessionOutcome::ClientWriteError => {
            // The server side is unaffected and message-aligned: recycle it.
            if let Some(lease) = lease {
                lease.reset();
            }
        }
        SessionOutcome::ServerReadError | SessionOutcome::ServerWriteError => {
            // Server framing state can no longer be trusted: discard it.
            if let Some(lease) = lease {
                lease.close();
            }
        }
    }

    outcome
}

async fn run_session(
    client: &mut ClientConnection,
    routes: &RoutePool,
) -> (SessionOutcome, Option<ServerLease>) {
    let Some(route) = routes
        .resolve(&client.startup.database, &client.startup.user)
        .await
    else {
        error!(
            "C: database route '{}' is not declared",
            client.startup.database
        );
        return (SessionOutcome::RouteNotFound, None);
    };

    if route.scheme.pooling_mode != PoolingMode::Session {
        warn!(
            "C: pooling mode '{}' is not implemented, rejecting session",
            route.scheme.pooling_mode
        );
        return (SessionOutcome::UnsupportedMode, None);
    }

    let mut lease = match route.pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => {
            error!(
                "C: failed to lease server for database '{}' user '{}': {}",
                route.identity.database, route.identity.user, e
            );
            return (SessionOutcome::PoolExhausted, None);
        }
    };

    info!(
        "C: client {} routed to server {} ({})",
        client.id,
        lease.server().id,
        route.pool.target()
    );

    let outcome = forward(client, &mut lease).await;
    (outcome, Some(lease))
}

/// The steady-state message pump for session-granularity pooling.
///
/// The server lease is held for the entire client session; per-request
/// release belongs to the unimplemented transaction/statement modes.
async fn forward(client: &mut ClientConnection, lease: &mut ServerLease) -> SessionOutcome {
    loop {
        // Client to server: one request message.
        let message = match protocol::read_message(&mut client.stream).await {
            Ok(message) => message,
            Err(_) => return SessionOutcome::ClientReadError,
        };
        trace!("C: {}", message.tag as char);

        if message.is_terminate() {
            return SessionOutcome::Ok;
        }

        if protocol::write_message(&mut lease.server_mut().stream, &message)
            .await
            .is_err()
        {
            return SessionOutcome::ServerWriteError;
        }

        // Server to client: keep feeding the client until the server is
        // ready for the next request.
        loop {
            let response = match protocol::read_message(&mut lease.server_mut().stream).await {
                Ok(response) => response,
                Err(_) => return SessionOutcome::ServerReadError,
            };
            trace!("S: {}", response.tag as char);

            if protocol::write_message(&mut client.stream, &response)
                .await
                .is_err()
            {
                return SessionOutcome::ClientWriteError;
            }

            if response.is_ready_for_query() {
                break;
            }
        }
    }
}
