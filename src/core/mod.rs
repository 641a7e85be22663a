/// Core pooling and routing machinery
pub mod backend;
pub mod frontend;
pub mod route;
pub mod session;

pub use backend::{AcquireError, ServerConnection, ServerLease, ServerPool, ServerState};
pub use frontend::{ClientConnection, StartupIdentity};
pub use route::{Route, RouteIdentity, RoutePool};
pub use session::{route_session, SessionOutcome};
