//! Passive Bluetooth device tracker.
//!
//! Scans continuously, enumerates each newly seen device's GATT database
//! once, stores every observation in SQLite and ranks stored devices by how
//! likely they are the same physical device under a different address.

pub mod domain;
pub mod infrastructure;

pub use domain::errors::{Error, Result};
