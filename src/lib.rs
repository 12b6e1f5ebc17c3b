//! Stateless pin tracker for a single IPFS node.
//!
//! [`PinTracker`] takes pin and unpin requests, runs them against the local
//! daemon through a bounded worker pool and answers status queries from the
//! operations it has seen. Nothing is persisted.

pub mod error;
pub mod ipfs;
pub mod model;
pub mod optracker;
pub mod scheduler;
pub mod settings;
pub mod tracker;

mod test_utils;

pub use error::TrackerError;
pub use model::{Cid, Pin, PinInfo, RemotePinStatus, TrackerStatus};
pub use tracker::PinTracker;
