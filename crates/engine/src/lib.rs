#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Update orchestration engine for sprout
//!
//! Ties the other crates together into the daemon's core object,
//! [`UpdateService`]: a status state machine broadcasting over the event
//! bus, a single-flight streaming pipeline (fetch, verify, decompress,
//! stage), and a confirmation gate between staging and commit.
//!
//! The engine never materializes an update payload in full. The source
//! archive is walked in one forward pass and the compressed image flows
//! straight into the snapshot sink while a streaming verifier watches the
//! bytes go by. Nothing becomes bootable until the verdict is in.

mod archive;
mod gate;
mod pipeline;
mod progress;
mod status;
mod verify_stream;

pub mod service;

pub use gate::{ConfirmationGate, PendingUpdate};
pub use service::UpdateService;
pub use status::StatusMachine;
