//! depot-relay is a one-way changelist replicator between two depot
//! servers of the same family: for every source changelist inside the
//! configured view it produces a semantically equivalent target changelist,
//! preserving content, file types, per-revision actions and integration
//! lineage, and tracks its progress in a persistent high-water counter.

pub mod client;
pub mod config;
pub mod digest;
pub mod errors;
pub mod logging;
pub mod paths;
pub mod replicate;
pub mod view;
