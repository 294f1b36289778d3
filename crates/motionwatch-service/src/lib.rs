//! HTTP API and check-in sweeper for a fleet of motion sensors.
//!
//! This crate provides a service that:
//! - Registers devices as they check in and tracks when each was last heard from
//! - Appends motion events reported by devices to per-device logs
//! - Starts and stops recording, and rotates device logs into numbered sets
//! - Marks devices that stop checking in
//! - Serves motion histograms and a status overview
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/status` - Per-device sets and devices not heard from
//! - `POST /api/devices/check-in` - Register or re-check-in a device
//! - `POST /api/sensor` - Report a motion event
//! - `GET /api/devices/{name}/status` - Poll recording and new-set instructions
//! - `GET /api/devices` - List all devices
//! - `PUT /api/devices/{name}/log` - Replace a device's active log
//! - `POST /api/record-mode` - Start or stop recording on devices
//! - `POST /api/new-set` - Rotate device logs into new sets
//! - `GET /api/chart?timeMeasure=hour|day|all` - Motion histograms
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/motionwatch/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8003"
//!
//! [storage]
//! path = "~/.local/share/motionwatch/server.db"
//! log_root = "~/.local/share/motionwatch/csv"
//!
//! [security]
//! # Required on every POST/PUT, in the X-Password header or ?password=
//! password = "change-me"
//!
//! [checkin]
//! timeout_secs = 300
//! ```

pub mod api;
pub mod config;
pub mod middleware;
pub mod state;

pub use config::{CheckInConfig, Config, ConfigError, SecurityConfig, ServerConfig, StorageConfig};
pub use state::AppState;
