//! Bluetooth Module
//!
//! Discovery, GATT enumeration and the pipeline that persists both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     TrackerService                       │
//! │  (starts the pipeline, owns the shutdown order)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  PipelineEvent channel
//!         ┌─────────────┼──────────────────┐
//!         │             │                  │
//!         ▼             ▼                  ▼
//! ┌─────────────┐ ┌──────────────┐  ┌─────────────┐
//! │  Scanner    │ │ GATT session │  │   Store     │
//! │             │ │   manager    │  │  (writes,   │
//! │ - discovery │ │ - retries    │  │   buffered) │
//! │ - extractor │ │ - Connection │  │             │
//! └──────┬──────┘ └──────┬───────┘  └─────────────┘
//!        │               │
//!        ▼               ▼
//! ┌─────────────────────────────┐
//! │  BleAdapter / GattSession   │
//! │  (btleplug or a test mock)  │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Adapter capability traits
//! - [`btleplug_backend`] - Cross-platform adapter implementation
//! - [`protocol`] - UUIDs, assigned numbers, value decoding, tree building
//! - [`scanner`] - Continuous discovery loop
//! - [`connection`] - One GATT walk of one device
//! - [`session`] - Once-per-address sessions with bounded retries
//! - [`service`] - Pipeline coordinator

pub mod adapter;
pub mod btleplug_backend;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;

// Re-export main service for convenience
pub use service::{PipelineStats, RunningPipeline, TrackerService};
