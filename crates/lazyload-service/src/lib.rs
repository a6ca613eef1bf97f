//! Asynchronous loader for remote artifacts.
//!
//! The [`Loader`](services::Loader) is the single entry point. A load request for a URL is
//! served from the in-memory cache, from the on-disk artifact store, or by scheduling a network
//! fetch. Concurrent requests for the same URL are coalesced into a single fetch, and every
//! interested consumer is notified exactly once, unless it has moved on to a newer request in the
//! meantime.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod services;
pub mod types;
pub mod utils;
