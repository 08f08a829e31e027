/// Blockchain communication module
/// Upstream node clients, failover and the shared work snapshot

pub mod node;
pub mod template_cache;
pub mod upstream;

pub use node::{NodeError, SubmitOutcome, UpstreamNode};
pub use template_cache::{BacklogEntry, PendingBlock, RefreshOutcome, TemplateCache, WorkSnapshot};
pub use upstream::UpstreamPool;
