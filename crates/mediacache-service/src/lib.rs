//! A client-side media acquisition cache.
//!
//! [`caching::MediaCache`] fetches media through a [`download::MediaFetcher`], deduplicating
//! concurrent requests, and keeps the bytes resident behind revocable handles until they expire
//! or are evicted. [`advisor::LoadingAdvisor`] decides per request whether a resource should be
//! streamed or cached in full, based on what [`probe::ConnectionProbe`] measures.

#[macro_use]
pub mod metrics;

pub mod advisor;
pub mod caching;
pub mod config;
pub mod download;
pub mod handles;
pub mod probe;
pub mod utils;
