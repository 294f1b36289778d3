//! Device registry, motion logs and check-in sweeping for motionwatch.
//!
//! This crate holds the state that many concurrent requests and one
//! background task share:
//!
//! - [`DeviceRegistry`]: the in-memory device table, written through to a
//!   [`DeviceStore`](motionwatch_store::DeviceStore) on every change
//! - [`EventLogStore`]: per-device active logs and their numbered set
//!   archives, including the rotation protocol
//! - [`CheckInSweeper`]: background task that marks silent devices
//! - [`ChartAggregator`]: read-only histograms over the active logs
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use motionwatch_core::{CheckInSweeper, DeviceRegistry, EventLogStore};
//! use motionwatch_store::Store;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let logs = Arc::new(EventLogStore::new("/var/lib/motionwatch/csv"));
//!     let registry = Arc::new(DeviceRegistry::load(Store::open_default()?, logs)?);
//!
//!     let status = registry.check_in("porch").await?;
//!     println!("porch records into set {}", status.device_set);
//!
//!     let sweeper = Arc::new(CheckInSweeper::new(registry, Duration::from_secs(300)));
//!     Arc::clone(&sweeper).start();
//!
//!     Ok(())
//! }
//! ```

pub mod chart;
pub mod error;
pub mod logs;
pub mod registry;
pub mod sweeper;

pub use chart::{Chart, ChartAggregator, bucket_index};
pub use error::{Error, Result, RotationRefusal};
pub use logs::EventLogStore;
pub use registry::{
    CheckInStatus, DeviceInstruction, DeviceRegistry, DeviceSummary, NewSetOutcome,
    NewSetResult, SilentDevice, StatusOverview,
};
pub use sweeper::CheckInSweeper;

// Re-export the shared types so callers need only this crate.
pub use motionwatch_types::{DeviceRecord, MotionEvent, ParseError, TimeMeasure};
