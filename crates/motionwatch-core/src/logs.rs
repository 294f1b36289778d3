//! Per-device motion logs and their numbered set archives.
//!
//! Layout under the log root:
//!
//! ```text
//! {root}/{device}.csv            active log, append target
//! {root}/sets/{device}/1.csv     first archived set
//! {root}/sets/{device}/2.csv     ...
//! ```
//!
//! # Locking
//!
//! Every operation that touches a device's files holds that device's lock for
//! its whole duration, so an append never interleaves with a rotation of the
//! same device. Locks are per device; appends for different devices proceed
//! in parallel.
//!
//! # Rotation
//!
//! Rotation copies the active log into the next numbered set and then
//! truncates the active log in place. The active path (and inode) never
//! changes. The copy is written to a hidden temporary file and renamed into
//! place only when complete, so a failed rotation never leaves a partial or
//! out-of-sequence set behind and the active log keeps its contents.
//!
//! The registry pairs every log change with a store write. When that write
//! fails it takes the change back with [`EventLogStore::truncate_active`] or
//! [`EventLogStore::restore_set`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use motionwatch_types::{MotionEvent, validate_device_name};

use crate::error::{Error, Result};

/// Name of the archive directory under the log root.
pub const SETS_DIR: &str = "sets";

const LOG_EXTENSION: &str = "csv";

/// Owner of the active logs and set archives of all devices.
#[derive(Debug)]
pub struct EventLogStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventLogStore {
    /// Create a store rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The log root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a device's active log.
    pub fn active_log_path(&self, device: &str) -> PathBuf {
        self.root.join(format!("{}.{}", device, LOG_EXTENSION))
    }

    /// Directory holding a device's archived sets.
    pub fn sets_dir(&self, device: &str) -> PathBuf {
        self.root.join(SETS_DIR).join(device)
    }

    /// Path of archived set `number` of a device.
    pub fn set_path(&self, device: &str, number: u32) -> PathBuf {
        self.sets_dir(device)
            .join(format!("{}.{}", number, LOG_EXTENSION))
    }

    /// Create the active-log directory and the device's archive directory.
    ///
    /// Idempotent.
    pub fn ensure_directories(&self, device: &str) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(Error::log_io("create", &self.root))?;

        let sets_dir = self.sets_dir(device);
        fs::create_dir_all(&sets_dir).map_err(Error::log_io("create", &sets_dir))?;

        Ok(())
    }

    /// Append one event line to the device's active log, creating it if absent.
    ///
    /// Returns the length of the log before the line was written.
    pub fn append(&self, event: &MotionEvent) -> Result<u64> {
        let path = self.active_log_path(&event.device_name);
        let line = event.to_line();

        let lock = self.device_lock(&event.device_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::log_io("open", &path))?;
        let offset = file
            .metadata()
            .map_err(Error::log_io("inspect", &path))?
            .len();

        // One write call per line keeps lines whole under O_APPEND.
        file.write_all(line.as_bytes())
            .map_err(Error::log_io("append to", &path))?;

        debug!("Appended event for {}", event.device_name);
        Ok(offset)
    }

    /// Cut a device's active log back to `len` bytes.
    pub fn truncate_active(&self, device: &str, len: u64) -> Result<()> {
        let path = self.active_log_path(device);

        let lock = self.device_lock(device);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_len(len))
            .map_err(Error::log_io("truncate", &path))?;

        debug!("Cut active log of {} back to {} bytes", device, len);
        Ok(())
    }

    /// Seal the active log into the next numbered set and empty it.
    ///
    /// Returns the number of the set that was written.
    pub fn rotate(&self, device: &str) -> Result<u32> {
        self.rotate_with(device, truncate_in_place)
    }

    fn rotate_with(
        &self,
        device: &str,
        truncate: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<u32> {
        let lock = self.device_lock(device);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let sets_dir = self.sets_dir(device);
        fs::create_dir_all(&sets_dir).map_err(Error::log_io("create", &sets_dir))?;

        let next = highest_set_number(&sets_dir)?.map_or(1, |n| n + 1);
        let active = self.active_log_path(device);
        let target = self.set_path(device, next);
        let partial = sets_dir.join(format!(".{}.{}.partial", next, LOG_EXTENSION));

        if let Err(e) = copy_into(&active, &partial) {
            remove_quietly(&partial);
            return Err(Error::log_io("archive", &active)(e));
        }

        if let Err(e) = fs::rename(&partial, &target) {
            remove_quietly(&partial);
            return Err(Error::log_io("archive", &target)(e));
        }

        if let Err(e) = truncate(&active) {
            // The lines are still in the active log; drop the copy so they
            // are not archived twice.
            remove_quietly(&target);
            return Err(Error::log_io("truncate", &active)(e));
        }

        info!("Rotated {} into set {}", device, next);
        Ok(next)
    }

    /// Put archived set `number` back at the front of the active log and
    /// delete the archive.
    ///
    /// Undoes the most recent [`rotate`](Self::rotate). Lines appended since
    /// the rotation stay after the restored ones.
    pub fn restore_set(&self, device: &str, number: u32) -> Result<()> {
        let lock = self.device_lock(device);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let archive = self.set_path(device, number);
        let active = self.active_log_path(device);

        let mut contents = fs::read(&archive).map_err(Error::log_io("read", &archive))?;
        match fs::read(&active) {
            Ok(tail) => contents.extend_from_slice(&tail),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::log_io("read", &active)(e)),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&active)
            .map_err(Error::log_io("open", &active))?;
        file.write_all(&contents)
            .map_err(Error::log_io("write", &active))?;

        fs::remove_file(&archive).map_err(Error::log_io("remove", &archive))?;

        info!("Restored set {} of {} into its active log", number, device);
        Ok(())
    }

    /// Numbers of a device's archived sets in ascending order.
    pub fn list_sets(&self, device: &str) -> Result<Vec<u32>> {
        let sets_dir = self.sets_dir(device);
        let mut numbers = match set_numbers(&sets_dir) {
            Ok(numbers) => numbers,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::log_io("list", &sets_dir)(e)),
        };
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Current contents of a device's active log. Missing logs read as empty.
    pub fn read_active(&self, device: &str) -> Result<Vec<u8>> {
        let path = self.active_log_path(device);

        let lock = self.device_lock(device);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::read(&path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::log_io("read", &path)(e)),
        }
    }

    /// Replace a device's active log with `contents`.
    pub fn replace_active(&self, device: &str, contents: &[u8]) -> Result<()> {
        validate_device_name(device)?;
        fs::create_dir_all(&self.root).map_err(Error::log_io("create", &self.root))?;

        let path = self.active_log_path(device);

        let lock = self.device_lock(device);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::log_io("open", &path))?;
        file.write_all(contents)
            .map_err(Error::log_io("write", &path))?;

        info!("Replaced active log of {} ({} bytes)", device, contents.len());
        Ok(())
    }

    /// Names of all devices that have an active log, sorted.
    pub fn active_devices(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::log_io("list", &self.root)(e)),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::log_io("list", &self.root))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_device_name(stem).is_ok() {
                devices.push(stem.to_string());
            } else {
                warn!("Ignoring log file with unusable name: {}", path.display());
            }
        }

        devices.sort();
        Ok(devices)
    }

    fn device_lock(&self, device: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(device.to_string()).or_default())
    }
}

// Keep the inode: writers may hold the active path open.
fn truncate_in_place(active: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(active)
        .map(drop)
}

fn copy_into(active: &Path, partial: &Path) -> io::Result<()> {
    let mut out = File::create(partial)?;
    match File::open(active) {
        Ok(mut src) => {
            io::copy(&mut src, &mut out)?;
        }
        // A device that never reported motion archives an empty set.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    out.sync_all()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to clean up {}: {}", path.display(), e);
    }
}

fn set_numbers(sets_dir: &Path) -> io::Result<Vec<u32>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(sets_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(number) = name
            .strip_suffix(".csv")
            .and_then(|stem| stem.parse::<u32>().ok())
            .filter(|n| *n > 0)
        {
            numbers.push(number);
        }
    }
    Ok(numbers)
}

fn highest_set_number(sets_dir: &Path) -> Result<Option<u32>> {
    set_numbers(sets_dir)
        .map(|numbers| numbers.into_iter().max())
        .map_err(Error::log_io("list", sets_dir))
}
