pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::CallConfig;
pub use error::{CallError, CallResult};
pub use session::{CallEvent, CallSession, CallStatus, EndReason};
pub use signaling::RoomId;
