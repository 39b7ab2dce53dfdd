//! The revision-reconstruction engine: classification, integration graph
//! resolution, workspace execution, submission and the replication loop.

pub mod changemap;
pub mod classify;
pub mod driver;
pub mod intent;
pub mod resolve;
pub mod setup;
pub mod submit;
pub mod workspace;
