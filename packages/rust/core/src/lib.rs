//! Content indexing pipeline for webindex.
//!
//! This crate ties the registry, dedup, crawl frontier, retry policy, and job
//! dispatch together into the claim-and-process cycle that moves indexed
//! items from PENDING to DONE. [`service::IndexService`] is the entry point
//! used by the CLI.

pub mod dedup;
pub mod dispatch;
pub mod embed;
pub mod frontier;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
