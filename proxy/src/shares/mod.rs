/// Mining shares module
///
/// Handles share classification, forwarding to the node, and persistence

pub mod processor;
pub mod solution;
pub mod storage;

pub use processor::{ShareProcessor, ShareVerdict};
pub use solution::{Solution, Submitter};
pub use storage::{BlockRecord, RedisStorage, ShareRecord, ShareStorage};
