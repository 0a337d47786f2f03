//! Download module
//!
//! Coordinates a whole transfer: peer tasks, piece accounting and hand-off of
//! verified pieces.

pub mod coordinator;


pub use coordinator::{DownloadCoordinator, DownloadReport};
