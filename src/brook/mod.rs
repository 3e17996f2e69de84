//! Brooks: append-only event streams and their positions
//!
//! The multiplexer never reads events. It only needs to know that a brook
//! moved, so everything here is about keys, positions and position streams.

pub mod key;
pub mod memory;
pub mod stream;

pub use key::{BrookKey, Position, PositionAdvanced};
pub use memory::MemoryBrookStreams;
pub use stream::{BrookPositionReader, BrookPositionStream, PositionObserver, StreamSubscription};
