//! Write path: optimistic local patches and the durable replay queue.

pub mod optimistic;
pub mod queue;

pub use optimistic::{OptimisticUpdater, Patched};
pub use queue::{DrainOutcome, PendingQueue, Trigger};
