#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Snapshot sink: incremental materialization of filesystem subvolumes
//!
//! The update pipeline hands a decompressed byte stream to a
//! [`SnapshotSink`], which materializes it as a named, initially-mutable
//! subvolume. The staged subvolume becomes bootable only through
//! `finalize`; `discard` removes a staged or partial subvolume. The
//! production implementation drives btrfs send/receive streams.

mod btrfs;

pub use btrfs::BtrfsSink;

use async_trait::async_trait;
use sprout_errors::Error;
use tokio::io::AsyncRead;

/// Destination for decompressed update payloads
///
/// A staged subvolume is exclusively owned by the update cycle that
/// created it until it is finalized or discarded.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Consume the stream and materialize a new mutable subvolume,
    /// returning its name. Implementations clean up their own partial
    /// subvolume when the receive fails midway.
    async fn receive(&self, stream: Box<dyn AsyncRead + Send + Unpin>) -> Result<String, Error>;

    /// Make the staged subvolume read-only and register it as the boot
    /// target. Only called after the payload signature verified.
    async fn finalize(&self, name: &str) -> Result<(), Error>;

    /// Delete a staged subvolume that will never be finalized.
    async fn discard(&self, name: &str) -> Result<(), Error>;

    /// Startup recovery: delete subvolumes left behind by an interrupted
    /// or abandoned cycle. Returns the names that were removed.
    async fn sweep_staged(&self) -> Result<Vec<String>, Error>;
}
