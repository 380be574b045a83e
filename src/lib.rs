pub mod engine;
pub mod error;
pub mod party;
pub mod session;

pub use engine::{Curve, EngineChannels, EngineFactory, EngineHandle, TrafficOut};
pub use error::{SessionError, SessionOutcome};
pub use session::{KeygenInit, SessionKind, SessionService, SignInit};

// error handling
pub type TssResult<Success> = anyhow::Result<Success>;

#[cfg(test)]
mod tests;
