//! Durable transactional event queue for a file-backed channel.
//!
//! Producers append events to rolling transaction logs; this crate maintains
//! the queue of committed, untaken events as a fixed-capacity ring of
//! [`EventPointer`]s inside a memory-mapped, checkpointed file, and rebuilds
//! that ring after a crash by replaying the logs in global write order.
//!
//! Delivery is at-least-once: anything not captured by the last completed
//! checkpoint is reconstructed from the logs alone, so a crash never loses a
//! committed event, though it can redeliver one.

pub mod error;
pub mod log;
pub mod pointer;
pub mod queue;
pub mod replay;
pub mod sequence;

pub use error::{Error, Result};
pub use pointer::EventPointer;
pub use queue::IndexQueue;
pub use replay::{ReplayEngine, ReplayMode, ReplayStats};
pub use sequence::SequenceOracle;
