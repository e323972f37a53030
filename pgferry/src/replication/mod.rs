//! Logical replication pipeline.
//!
//! The engine is a unidirectional pipeline: the stream decoder owns the
//! replication connection and produces decoded messages, the snapshot
//! copier moves the initial data, the applier replays changes on the
//! destination, and the sentinel coordinator witnesses cutover. The
//! orchestrator wires them together with bounded channels.

pub mod applier;
pub mod copy;
pub mod copy_statement;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod lsn;
pub mod message;
pub mod orchestrator;
pub mod progress;
pub mod schema;
pub mod sentinel;
pub mod slot;

pub use decoder::{Confirm, StreamDecoder};
pub use error::Error;
pub use lsn::Lsn;
pub use message::{Change, ChangeKind, Message, MessageBody, Relation, Tuple};
pub use orchestrator::Pipeline;
pub use progress::{MetricsSink, Phase, Progress};
pub use sentinel::SentinelCoordinator;
