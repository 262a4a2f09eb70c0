#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Status notification system for the sprout update engine
//!
//! The engine's only observable side channel is the stream of
//! [`StatusRecord`] transitions published through the [`StatusBus`].
//! Every state machine transition is published; observers subscribe
//! and receive an ordered queue of records. Slow observers never block
//! the pipeline: each subscriber has a bounded queue that sheds the
//! oldest coalescible progress update when full. Terminal records and
//! records that change the status are never dropped.

pub mod bus;
pub mod status;

pub use bus::{StatusBus, StatusSubscription};
pub use status::{StatusRecord, UpdateStatus, PROGRESS_UNKNOWN};
