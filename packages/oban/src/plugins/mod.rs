//! Leader-only plugins.
//!
//! These run on every node but act only while the node holds the cluster
//! lease, observed through the leadership watch flag. Losing the lease stops
//! them promptly; regaining it resumes them.

mod lifeline;
mod pruner;
mod scheduler;

pub use lifeline::Lifeline;
pub use pruner::Pruner;
pub use scheduler::Scheduler;
