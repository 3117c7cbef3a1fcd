//! Chat sessions and response streaming.
//!
//! [`backend::LocalBackend`] owns generation: it assembles the prompt,
//! streams the model's reply as [`stream::StreamEvent`]s and enforces one
//! open stream per session. [`engine::ChatEngine`] drives it one turn at a
//! time and turns each stream into exactly one persisted assistant message.

pub mod backend;
pub mod context;
pub mod engine;
mod generation;
pub mod registry;
pub mod session;
pub mod stream;

pub use backend::{ChatBackend, LocalBackend, StreamRequest};
pub use engine::{ChatEngine, EngineEvent, StopHandle, TurnOutcome};
pub use registry::{ActiveStreams, TEMP_STREAM_ID};
pub use session::{DraftSession, Promotion, Session};
pub use stream::{StreamEvent, TurnAccumulator};
