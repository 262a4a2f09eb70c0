#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Source fetching for the sprout update engine
//!
//! Produces a byte stream plus an optional declared length from either a
//! local file or a URL. Failures are surfaced, never retried here: retry
//! policy belongs to whatever hands requests to the engine.

mod client;
mod fetcher;

pub use client::{NetClient, NetConfig};
pub use fetcher::{SourceFetcher, SourceStream, UpdateSource};
