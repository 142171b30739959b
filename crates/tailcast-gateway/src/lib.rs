pub mod ratelimit;
pub mod routes;
pub mod server;
pub mod sse;
pub mod state;

pub use server::GatewayServer;
pub use sse::SseBroker;
pub use state::{AppState, AttachOutcome, AttachRequest, ServiceApi};
