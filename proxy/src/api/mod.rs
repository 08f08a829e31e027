/// Miner-facing API: wire types, gateway operations and the HTTP binding

pub mod handlers;
pub mod protocol;
pub mod server;

pub use handlers::{Gateway, StatusReply, SubmitResult};
pub use protocol::{ErrorReply, WorkReply};
pub use server::{router, serve, ApiState};
