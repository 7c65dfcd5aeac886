mod error;
mod host;
mod routes;
mod shutdown;

pub use error::HostError;
pub use host::{AppHost, HostStatus};
pub use routes::{RouteInfo, RouterBuilder};
pub use shutdown::{ShutdownCoordinator, ShutdownOptions, ShutdownOutcome, ShutdownPhase};
