//! Parley voice gateway.
//!
//! Accepts client audio websockets, runs one [`session::Session`] per
//! client, and drives each session's turns through the
//! [`orchestrator::Orchestrator`].

pub mod client;
pub mod manager;
pub mod metrics;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod state;

pub use manager::{BackendFactory, Backends, SessionManager};
pub use orchestrator::TurnState;
pub use server::{router, serve_gateway, start_gateway};
pub use session::Session;
pub use state::GatewayState;
