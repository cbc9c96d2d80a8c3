//! Chatmeter Shared Types and Utilities
//!
//! Records, tiers and time handling shared by the billing, api and worker crates.

pub mod clock;
pub mod db;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, StoredInstant, SystemClock};
pub use db::*;
pub use error::*;
pub use types::*;
