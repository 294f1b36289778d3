//! Shared types for the motionwatch device fleet registry.
//!
//! This crate provides the data shapes used by the store, the core registry
//! and the HTTP service.
//!
//! # Features
//!
//! - [`DeviceRecord`], the canonical per-device state
//! - [`MotionEvent`], one line of a device's motion log
//! - [`TimeMeasure`], the chart granularity selector
//! - Device name validation and parse errors
//!
//! # Example
//!
//! ```
//! use motionwatch_types::MotionEvent;
//!
//! let event: MotionEvent = "porch-1,2024-05-01,12:30:00,True".parse()?;
//! assert!(event.movement);
//! assert_eq!(event.to_line(), "porch-1,2024-05-01,12:30:00,true\n");
//! # Ok::<(), motionwatch_types::ParseError>(())
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    DeviceRecord, MAX_DEVICE_NAME_LEN, MotionEvent, TimeMeasure, parse_movement, parse_timestamp,
    validate_device_name,
};
