#![forbid(unsafe_code)]

//! ctsieve worker: pulls job ranges from the manager, streams CT
//! entries from the assigned log, filters them to the configured
//! domain suffix, and uploads the survivors in bounded batches.

pub mod cli;
pub mod ctlog;
pub mod fetch;
pub mod manager_api;
pub mod shutdown;
pub mod spool;
