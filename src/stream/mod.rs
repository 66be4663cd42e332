//! The detector data stream.
//!
//! - [`transport`]: where encoded messages go.
//! - [`engine`]: state machine and frame cache.
//! - [`actor`]: single task owning the engine, driven through a handle.

pub mod actor;
pub mod engine;
pub mod transport;

pub use actor::{DetectorActor, DetectorCommand, DetectorHandle};
pub use engine::{prepare_load, EngineStatus, LoadRequest, PreparedDataset, StreamEngine, StreamState, TriggerSummary};
pub use transport::{ChannelTransport, Transport, ZmqPushTransport};
