//! SQLite persistence for motionwatch device state.
//!
//! The store keeps one row per device in the `device_status` table. Rows are
//! written through on every committed registry mutation and loaded in full
//! at startup.
//!
//! # Example
//!
//! ```no_run
//! use motionwatch_store::{DeviceStore, Store};
//!
//! let store = Store::open_default()?;
//! for device in store.load_devices()? {
//!     println!("{} is on set {}", device.name, device.set_number);
//! }
//! # Ok::<(), motionwatch_store::Error>(())
//! ```

mod error;
mod schema;
mod store;

pub use error::{Error, Result};
pub use store::{DeviceStore, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/motionwatch/server.db`
/// - macOS: `~/Library/Application Support/motionwatch/server.db`
/// - Windows: `C:\Users\<user>\AppData\Local\motionwatch\server.db`
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join("server.db")
}

/// Default directory for motionwatch data files.
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("motionwatch")
}
