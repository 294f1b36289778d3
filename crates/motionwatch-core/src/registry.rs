//! In-memory device registry with write-through persistence.
//!
//! # Lock discipline
//!
//! - `records` (RwLock): shared for reads, exclusive for every mutation. A
//!   mutation holds the exclusive guard across its whole check-and-act,
//!   including the store write, so two concurrent requests for the same device
//!   cannot both pass validation.
//! - `store` (Mutex): taken only while holding `records` exclusively.
//! - Device log locks inside [`EventLogStore`] are taken only after `records`.
//!
//! Mutations work on a copy of the record, write the copy through to the store
//! and only then swap it into the map. A failed store write leaves the map
//! untouched, and any log change made for the mutation is taken back: an
//! appended line is cut off again and a rotated set is restored into the
//! active log.
//!
//! A record-mode change is written in one store transaction for the whole
//! batch. A new-set batch releases `records` between devices so readers are
//! not starved by a long batch.
//!
//! File and database work is synchronous and runs on the calling task, under
//! [`tokio::task::block_in_place`] on a multi-threaded runtime. It is never
//! handed to a separate task, so a dropped request cannot stop a mutation
//! between its log change and its store write.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use motionwatch_store::{DeviceStore, Store};
use motionwatch_types::{DeviceRecord, MotionEvent, validate_device_name};

use crate::error::{Error, Result, RotationRefusal};
use crate::logs::EventLogStore;

/// Flags returned to a device after a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInStatus {
    /// A new set was requested and not yet acknowledged.
    pub has_new_set_not_recording: bool,
    /// Whether the device should sample.
    pub is_recording: bool,
    /// The set the device is recording into.
    pub device_set: u32,
}

impl From<&DeviceRecord> for CheckInStatus {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            has_new_set_not_recording: record.is_new_set,
            is_recording: record.is_recording,
            device_set: record.set_number,
        }
    }
}

/// Instruction for a device after a sensor ping or status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInstruction {
    /// Whether the device should keep sampling.
    pub is_recording: bool,
    /// Whether the device should start a fresh local buffer.
    pub new_set: bool,
}

impl DeviceInstruction {
    /// Render as the line-protocol text devices understand,
    /// e.g. `"Record,Continue Set"`.
    pub fn message(&self) -> String {
        format!(
            "{},{}",
            if self.is_recording {
                "Record"
            } else {
                "Stop Recording"
            },
            if self.new_set { "New Set" } else { "Continue Set" }
        )
    }
}

/// A set that was started by [`DeviceRegistry::request_new_set`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSetResult {
    pub device_name: String,
    /// Number of the archive file the active log was sealed into.
    pub archived_set: u32,
    /// Set number after the increment.
    pub set_number: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub latest_set_time: OffsetDateTime,
}

/// Outcome of a batch new-set request.
///
/// Partial success is normal: each device is handled independently.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSetOutcome {
    /// Devices whose set was rotated.
    pub results: Vec<NewSetResult>,
    /// One line per rejected device, in request order.
    pub message: String,
}

impl NewSetOutcome {
    fn reject(&mut self, error: &Error) {
        self.message.push_str(&error.to_string());
        self.message.push('\n');
    }
}

/// Per-device row of the status overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_name: String,
    pub num_of_sets: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_set: Option<OffsetDateTime>,
    pub is_recording: bool,
    pub is_new_set: bool,
    pub is_checked_in: bool,
}

/// A device the sweeper has marked as not heard from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SilentDevice {
    pub device_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_check_in: OffsetDateTime,
}

/// Status of every device plus the silent ones.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOverview {
    pub devices: Vec<DeviceSummary>,
    pub devices_not_heard_from: Vec<SilentDevice>,
}

/// Single source of truth for device state.
pub struct DeviceRegistry<S = Store> {
    records: RwLock<HashMap<String, DeviceRecord>>,
    store: Mutex<S>,
    logs: Arc<EventLogStore>,
}

impl<S: DeviceStore> DeviceRegistry<S> {
    /// Build the registry from every row in `store`.
    pub fn load(store: S, logs: Arc<EventLogStore>) -> Result<Self> {
        let devices = store.load_devices()?;

        let mut records = HashMap::with_capacity(devices.len());
        for device in devices {
            logs.ensure_directories(&device.name)?;
            records.insert(device.name.clone(), device);
        }

        info!("Registry loaded with {} device(s)", records.len());

        Ok(Self {
            records: RwLock::new(records),
            store: Mutex::new(store),
            logs,
        })
    }

    /// The log store this registry rotates into.
    pub fn logs(&self) -> &Arc<EventLogStore> {
        &self.logs
    }

    /// Register a new device or check a known one back in.
    pub async fn check_in(&self, name: &str) -> Result<CheckInStatus> {
        validate_device_name(name)?;
        let now = now_utc();

        let mut records = self.records.write().await;

        let record = match records.get(name) {
            Some(existing) if existing.is_checked_in => {
                return Err(Error::AlreadyCheckedIn(name.to_string()));
            }
            Some(existing) => {
                let mut updated = existing.clone();
                updated.latest_check_in_time = now;
                updated.is_checked_in = true;
                self.persist(&updated).await?;
                info!("{} checked back in", name);
                updated
            }
            None => {
                blocking(|| self.logs.ensure_directories(name))?;
                let created = DeviceRecord::new(name, now);
                self.persist(&created).await?;
                info!("Registered new device {}", name);
                created
            }
        };

        let status = CheckInStatus::from(&record);
        records.insert(name.to_string(), record);
        Ok(status)
    }

    /// Start or stop recording on the named devices.
    ///
    /// Unknown names are skipped. Returns the resulting flag for every known
    /// name. The batch is all or nothing: if the store write fails, no device
    /// changes.
    pub async fn set_recording(
        &self,
        names: &[String],
        recording: bool,
    ) -> Result<BTreeMap<String, bool>> {
        let mut statuses = BTreeMap::new();
        let mut changed: Vec<DeviceRecord> = Vec::new();
        let mut records = self.records.write().await;

        for name in names {
            let Some(current) = records.get(name) else {
                debug!("Skipping unknown device {} in record-mode change", name);
                continue;
            };

            if current.is_recording != recording && !changed.iter().any(|r| &r.name == name) {
                let mut updated = current.clone();
                updated.is_recording = recording;
                changed.push(updated);
            }

            statuses.insert(name.clone(), recording);
        }

        if !changed.is_empty() {
            self.persist_all(&changed).await?;
        }

        for updated in changed {
            info!(
                "{} {} recording",
                updated.name,
                if recording { "started" } else { "stopped" }
            );
            records.insert(updated.name.clone(), updated);
        }

        Ok(statuses)
    }

    /// Rotate the log set of each named device that is eligible.
    ///
    /// A device is eligible when it is not recording and has no unacknowledged
    /// new set. Ineligible or failing devices add a reason to the message and
    /// the batch continues.
    pub async fn request_new_set(&self, names: &[String]) -> NewSetOutcome {
        let mut outcome = NewSetOutcome::default();

        for name in names {
            match self.start_new_set(name).await {
                Ok(result) => outcome.results.push(result),
                Err(e) if e.is_client_error() => {
                    debug!("New set refused: {}", e);
                    outcome.reject(&e);
                }
                Err(e) => {
                    error!("New set for {} failed: {}", name, e);
                    outcome.reject(&e);
                }
            }
        }

        outcome
    }

    async fn start_new_set(&self, name: &str) -> Result<NewSetResult> {
        let mut records = self.records.write().await;

        let current = records
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;

        if current.is_recording {
            return Err(Error::InvalidStateForRotation {
                device: name.to_string(),
                reason: RotationRefusal::Recording,
            });
        }
        if current.is_new_set {
            return Err(Error::InvalidStateForRotation {
                device: name.to_string(),
                reason: RotationRefusal::NewSetPending,
            });
        }

        let archived_set = blocking(|| self.logs.rotate(name))?;
        let now = now_utc();

        let mut updated = current;
        updated.is_new_set = true;
        updated.set_number += 1;
        updated.latest_set_time = Some(now);

        if let Err(e) = self.persist(&updated).await {
            match blocking(|| self.logs.restore_set(name, archived_set)) {
                Ok(()) => warn!(
                    "State of {} was not saved; set {} was put back into its active log",
                    name, archived_set
                ),
                Err(undo) => error!(
                    "State of {} was not saved and set {} could not be put back: {}",
                    name, archived_set, undo
                ),
            }
            return Err(e);
        }

        let result = NewSetResult {
            device_name: name.to_string(),
            archived_set,
            set_number: updated.set_number,
            latest_set_time: now,
        };
        records.insert(name.to_string(), updated);

        Ok(result)
    }

    /// Record a ping from a device and log its motion event.
    ///
    /// The ping refreshes the check-in time and acknowledges a pending new
    /// set. Only events with movement are appended to the log. The line is
    /// written before the record is committed; if either step fails the
    /// device keeps its pending new set and the log keeps its prior lines.
    pub async fn record_sensor_ping(&self, event: &MotionEvent) -> Result<DeviceInstruction> {
        let name = event.device_name.as_str();
        let now = now_utc();

        let mut records = self.records.write().await;

        let mut updated = records
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;

        let acknowledged = updated.is_new_set;
        updated.latest_check_in_time = now;
        updated.is_checked_in = true;
        updated.is_new_set = false;

        let appended_at = if event.movement {
            Some(blocking(|| self.logs.append(event))?)
        } else {
            None
        };

        if let Err(e) = self.persist(&updated).await {
            if let Some(len) = appended_at
                && let Err(undo) = blocking(|| self.logs.truncate_active(name, len))
            {
                error!("Event logged for {} could not be taken back: {}", name, undo);
            }
            return Err(e);
        }

        if acknowledged {
            info!("{} started its new set", name);
        }

        let instruction = DeviceInstruction {
            is_recording: updated.is_recording,
            new_set: acknowledged,
        };
        records.insert(name.to_string(), updated);

        Ok(instruction)
    }

    /// Answer a device asking whether it may record or must start a new set.
    ///
    /// Refreshes the check-in time but leaves the pending new-set flag and the
    /// checked-in flag alone.
    pub async fn poll_status(&self, name: &str) -> Result<DeviceInstruction> {
        let mut records = self.records.write().await;

        let mut updated = records
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;
        updated.latest_check_in_time = now_utc();

        self.persist(&updated).await?;

        let instruction = DeviceInstruction {
            is_recording: updated.is_recording,
            new_set: updated.is_new_set,
        };
        records.insert(name.to_string(), updated);
        Ok(instruction)
    }

    /// Mark a device as not checked in if it is still stale at `now`.
    ///
    /// Returns whether the device was demoted. The staleness check is
    /// repeated under the exclusive lock so a check-in that lands between the
    /// sweeper's snapshot and this call wins.
    pub async fn mark_checked_out(
        &self,
        name: &str,
        now: OffsetDateTime,
        timeout: time::Duration,
    ) -> Result<bool> {
        let mut records = self.records.write().await;

        let Some(current) = records.get(name) else {
            return Err(Error::UnknownDevice(name.to_string()));
        };
        if !current.is_checked_in || !current.is_stale(now, timeout) {
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.is_checked_in = false;
        self.persist(&updated).await?;
        records.insert(name.to_string(), updated);

        Ok(true)
    }

    /// Copy of every record, sorted by name.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let records = self.records.read().await;
        let mut devices: Vec<DeviceRecord> = records.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Copy of one record.
    pub async fn get(&self, name: &str) -> Option<DeviceRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// Per-device set counts and the devices that have gone silent.
    pub async fn status_overview(&self) -> StatusOverview {
        let mut overview = StatusOverview::default();

        for record in self.snapshot().await {
            if !record.is_checked_in {
                overview.devices_not_heard_from.push(SilentDevice {
                    device_name: record.name.clone(),
                    last_check_in: record.latest_check_in_time,
                });
            }
            overview.devices.push(DeviceSummary {
                num_of_sets: record.completed_sets(),
                latest_set: record.latest_set_time,
                is_recording: record.is_recording,
                is_new_set: record.is_new_set,
                is_checked_in: record.is_checked_in,
                device_name: record.name,
            });
        }

        overview
    }

    async fn persist(&self, record: &DeviceRecord) -> Result<()> {
        let store = self.store.lock().await;
        blocking(|| store.upsert_device(record))?;
        Ok(())
    }

    async fn persist_all(&self, records: &[DeviceRecord]) -> Result<()> {
        let store = self.store.lock().await;
        blocking(|| store.upsert_devices(records))?;
        Ok(())
    }
}

/// Run file or database work on the current worker.
///
/// On a multi-threaded runtime the worker hands its other tasks off first.
fn blocking<T>(op: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(op)
        }
        _ => op(),
    }
}

/// Current time at the second precision the store keeps.
fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store wrapper whose writes can be made to fail.
    struct FlakyStore {
        inner: Store,
        fail: Arc<AtomicBool>,
    }

    impl DeviceStore for FlakyStore {
        fn upsert_device(&self, record: &DeviceRecord) -> motionwatch_store::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(motionwatch_store::Error::Io(std::io::Error::other(
                    "disk unplugged",
                )));
            }
            self.inner.upsert_device(record)
        }

        fn upsert_devices(&self, records: &[DeviceRecord]) -> motionwatch_store::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(motionwatch_store::Error::Io(std::io::Error::other(
                    "disk unplugged",
                )));
            }
            self.inner.upsert_devices(records)
        }

        fn load_devices(&self) -> motionwatch_store::Result<Vec<DeviceRecord>> {
            self.inner.load_devices()
        }
    }

    fn create_test_registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(EventLogStore::new(dir.path().join("csv")));
        let registry = DeviceRegistry::load(Store::open_in_memory().unwrap(), logs).unwrap();
        (dir, registry)
    }

    fn create_flaky_registry() -> (tempfile::TempDir, DeviceRegistry<FlakyStore>, Arc<AtomicBool>)
    {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(EventLogStore::new(dir.path().join("csv")));
        let fail = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: Store::open_in_memory().unwrap(),
            fail: Arc::clone(&fail),
        };
        (dir, DeviceRegistry::load(store, logs).unwrap(), fail)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ping(name: &str, movement: bool) -> MotionEvent {
        MotionEvent::new(name, OffsetDateTime::now_utc(), movement)
    }

    async fn demote(registry: &DeviceRegistry<impl DeviceStore>, name: &str) {
        let far_future = OffsetDateTime::now_utc() + time::Duration::days(1);
        assert!(
            registry
                .mark_checked_out(name, far_future, time::Duration::seconds(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_check_in_registers_new_device() {
        let (_dir, registry) = create_test_registry();
        let before = now_utc();

        let status = registry.check_in("porch").await.unwrap();

        assert_eq!(
            status,
            CheckInStatus {
                has_new_set_not_recording: false,
                is_recording: true,
                device_set: 1,
            }
        );
        let record = registry.get("porch").await.unwrap();
        assert!(record.is_checked_in);
        assert!(record.latest_check_in_time >= before);
        assert!(registry.logs().sets_dir("porch").is_dir());

        let stored = registry.store.lock().await.load_devices().unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[tokio::test]
    async fn test_check_in_twice_is_rejected() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("porch").await.unwrap();
        registry
            .set_recording(&names(&["porch"]), false)
            .await
            .unwrap();

        let result = registry.check_in("porch").await;

        assert!(matches!(result, Err(Error::AlreadyCheckedIn(_))));
        let record = registry.get("porch").await.unwrap();
        assert_eq!(record.set_number, 1);
        assert!(!record.is_recording);
    }

    #[tokio::test]
    async fn test_check_in_after_demotion() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("porch").await.unwrap();
        demote(&registry, "porch").await;
        assert!(!registry.get("porch").await.unwrap().is_checked_in);

        let status = registry.check_in("porch").await.unwrap();

        assert!(status.is_recording);
        assert!(registry.get("porch").await.unwrap().is_checked_in);
    }

    #[tokio::test]
    async fn test_check_in_rejects_unsafe_name() {
        let (_dir, registry) = create_test_registry();
        let result = registry.check_in("../../etc/passwd").await;
        assert!(matches!(result, Err(Error::InvalidDeviceName(_))));
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_recording_skips_unknown() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("a").await.unwrap();
        registry.check_in("b").await.unwrap();

        let statuses = registry
            .set_recording(&names(&["a", "ghost", "b"]), false)
            .await
            .unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.get("a"), Some(&false));
        assert_eq!(statuses.get("b"), Some(&false));
        assert!(!registry.get("a").await.unwrap().is_recording);

        // Same value again is a no-op but still reported
        let statuses = registry
            .set_recording(&names(&["a"]), false)
            .await
            .unwrap();
        assert_eq!(statuses.get("a"), Some(&false));
    }

    #[tokio::test]
    async fn test_request_new_set_mixed_batch() {
        let (_dir, registry) = create_test_registry();
        for name in ["recording", "pending", "eligible"] {
            registry.check_in(name).await.unwrap();
        }
        registry
            .set_recording(&names(&["pending", "eligible"]), false)
            .await
            .unwrap();
        registry.request_new_set(&names(&["pending"])).await;
        assert!(registry.get("pending").await.unwrap().is_new_set);

        let outcome = registry
            .request_new_set(&names(&["recording", "pending", "eligible"]))
            .await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].device_name, "eligible");
        assert_eq!(outcome.results[0].archived_set, 1);
        assert_eq!(outcome.results[0].set_number, 2);

        let lines: Vec<&str> = outcome.message.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("recording is recording"));
        assert_eq!(lines[1], "pending still hasn't reset to new set");

        assert_eq!(registry.logs().list_sets("eligible").unwrap(), vec![1]);
        assert_eq!(registry.logs().list_sets("pending").unwrap(), vec![1]);
        assert!(registry.logs().list_sets("recording").unwrap().is_empty());

        let eligible = registry.get("eligible").await.unwrap();
        assert!(eligible.is_new_set);
        assert!(eligible.latest_set_time.is_some());
    }

    #[tokio::test]
    async fn test_request_new_set_unknown_device() {
        let (_dir, registry) = create_test_registry();
        let outcome = registry.request_new_set(&names(&["ghost"])).await;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.message, "ghost is not registered\n");
    }

    #[tokio::test]
    async fn test_concurrent_new_set_requests_rotate_once() {
        let (_dir, registry) = create_test_registry();
        let registry = Arc::new(registry);
        registry.check_in("cam").await.unwrap();
        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.request_new_set(&names(&["cam"])).await })
            })
            .collect();

        let mut started = 0;
        for task in tasks {
            started += task.await.unwrap().results.len();
        }

        assert_eq!(started, 1);
        assert_eq!(registry.get("cam").await.unwrap().set_number, 2);
        assert_eq!(registry.logs().list_sets("cam").unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_sensor_ping_acknowledges_new_set() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();
        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();
        registry.request_new_set(&names(&["cam"])).await;

        let first = registry.record_sensor_ping(&ping("cam", false)).await.unwrap();
        assert_eq!(
            first,
            DeviceInstruction {
                is_recording: false,
                new_set: true,
            }
        );
        assert_eq!(first.message(), "Stop Recording,New Set");

        let second = registry.record_sensor_ping(&ping("cam", false)).await.unwrap();
        assert!(!second.new_set);
        assert!(!registry.get("cam").await.unwrap().is_new_set);

        // Acknowledged, so another rotation is allowed
        let outcome = registry.request_new_set(&names(&["cam"])).await;
        assert_eq!(outcome.results[0].archived_set, 2);
        assert_eq!(outcome.results[0].set_number, 3);
    }

    #[tokio::test]
    async fn test_sensor_ping_logs_only_movement() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();

        let instruction = registry.record_sensor_ping(&ping("cam", true)).await.unwrap();
        assert_eq!(instruction.message(), "Record,Continue Set");
        registry.record_sensor_ping(&ping("cam", false)).await.unwrap();
        registry.record_sensor_ping(&ping("cam", true)).await.unwrap();

        let contents = String::from_utf8(registry.logs().read_active("cam").unwrap()).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().all(|line| line.ends_with(",true")));
    }

    #[tokio::test]
    async fn test_sensor_ping_unknown_device() {
        let (_dir, registry) = create_test_registry();
        let result = registry.record_sensor_ping(&ping("ghost", true)).await;
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
        assert!(registry.logs().read_active("ghost").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sensor_ping_rechecks_in_device() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();
        demote(&registry, "cam").await;

        registry.record_sensor_ping(&ping("cam", false)).await.unwrap();

        assert!(registry.get("cam").await.unwrap().is_checked_in);
    }

    #[tokio::test]
    async fn test_poll_status_keeps_pending_flag() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();
        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();
        registry.request_new_set(&names(&["cam"])).await;

        let instruction = registry.poll_status("cam").await.unwrap();
        assert!(instruction.new_set);
        assert!(!instruction.is_recording);
        assert!(registry.get("cam").await.unwrap().is_new_set);

        assert!(matches!(
            registry.poll_status("ghost").await,
            Err(Error::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_checked_out_respects_fresh_check_in() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();

        let demoted = registry
            .mark_checked_out("cam", now_utc(), time::Duration::minutes(5))
            .await
            .unwrap();

        assert!(!demoted);
        assert!(registry.get("cam").await.unwrap().is_checked_in);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_state_unchanged() {
        let (_dir, registry, fail) = create_flaky_registry();
        registry.check_in("cam").await.unwrap();
        registry.record_sensor_ping(&ping("cam", true)).await.unwrap();
        let before = registry.get("cam").await.unwrap();
        let logged = registry.logs().read_active("cam").unwrap();

        fail.store(true, Ordering::SeqCst);

        let result = registry
            .set_recording(&names(&["cam"]), false)
            .await;
        assert!(matches!(result, Err(Error::Persistence(_))));

        // The line written for the failed ping is cut off again
        let result = registry.record_sensor_ping(&ping("cam", true)).await;
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(registry.logs().read_active("cam").unwrap(), logged);

        let result = registry.check_in("new-cam").await;
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert!(registry.get("new-cam").await.is_none());

        assert_eq!(registry.get("cam").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_new_set_persistence_failure_is_per_device() {
        let (_dir, registry, fail) = create_flaky_registry();
        registry.check_in("cam").await.unwrap();
        registry.record_sensor_ping(&ping("cam", true)).await.unwrap();
        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();
        let logged = registry.logs().read_active("cam").unwrap();
        assert!(!logged.is_empty());

        fail.store(true, Ordering::SeqCst);
        let outcome = registry.request_new_set(&names(&["cam", "ghost"])).await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.message.lines().count(), 2);
        let record = registry.get("cam").await.unwrap();
        assert_eq!(record.set_number, 1);
        assert!(!record.is_new_set);

        // The rotation was undone on disk too
        assert!(registry.logs().list_sets("cam").unwrap().is_empty());
        assert_eq!(registry.logs().read_active("cam").unwrap(), logged);

        fail.store(false, Ordering::SeqCst);
        let outcome = registry.request_new_set(&names(&["cam"])).await;
        assert_eq!(outcome.results[0].archived_set, 1);
        assert_eq!(outcome.results[0].set_number, 2);
        assert_eq!(
            std::fs::read(registry.logs().set_path("cam", 1)).unwrap(),
            logged
        );
        assert_eq!(
            registry.get("cam").await.unwrap().completed_sets(),
            registry.logs().list_sets("cam").unwrap().len() as u32
        );
    }

    #[tokio::test]
    async fn test_set_recording_failure_changes_no_device() {
        let (_dir, registry, fail) = create_flaky_registry();
        registry.check_in("a").await.unwrap();
        registry.check_in("b").await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let result = registry.set_recording(&names(&["a", "b"]), false).await;

        assert!(matches!(result, Err(Error::Persistence(_))));
        assert!(registry.get("a").await.unwrap().is_recording);
        assert!(registry.get("b").await.unwrap().is_recording);
        let stored = registry.store.lock().await.load_devices().unwrap();
        assert!(stored.iter().all(|d| d.is_recording));

        fail.store(false, Ordering::SeqCst);
        let statuses = registry
            .set_recording(&names(&["a", "b", "a"]), false)
            .await
            .unwrap();
        assert_eq!(statuses.len(), 2);
        let stored = registry.store.lock().await.load_devices().unwrap();
        assert!(stored.iter().all(|d| !d.is_recording));
    }

    #[tokio::test]
    async fn test_sensor_ping_log_failure_keeps_pending_flag() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("cam").await.unwrap();
        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();
        registry.request_new_set(&names(&["cam"])).await;

        // A directory in place of the active log makes the append fail
        let active = registry.logs().active_log_path("cam");
        std::fs::remove_file(&active).unwrap();
        std::fs::create_dir(&active).unwrap();

        let result = registry.record_sensor_ping(&ping("cam", true)).await;

        assert!(matches!(result, Err(Error::LogIo { .. })));
        assert!(registry.get("cam").await.unwrap().is_new_set);
        let stored = registry.store.lock().await.load_devices().unwrap();
        assert!(stored[0].is_new_set);

        std::fs::remove_dir(&active).unwrap();
        let instruction = registry.record_sensor_ping(&ping("cam", true)).await.unwrap();
        assert!(instruction.new_set);
        assert_eq!(instruction.message(), "Stop Recording,New Set");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_log_work_on_multi_thread_runtime() {
        let (_dir, registry) = create_test_registry();
        let registry = Arc::new(registry);
        registry.check_in("cam").await.unwrap();

        let pinger = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..20 {
                    registry.record_sensor_ping(&ping("cam", true)).await.unwrap();
                }
            })
        };
        pinger.await.unwrap();

        registry
            .set_recording(&names(&["cam"]), false)
            .await
            .unwrap();
        let outcome = registry.request_new_set(&names(&["cam"])).await;

        assert_eq!(outcome.results.len(), 1, "{}", outcome.message);
        let archived = std::fs::read_to_string(registry.logs().set_path("cam", 1)).unwrap();
        assert_eq!(archived.lines().count(), 20);
    }

    #[tokio::test]
    async fn test_status_overview() {
        let (_dir, registry) = create_test_registry();
        registry.check_in("b").await.unwrap();
        registry.check_in("a").await.unwrap();
        registry
            .set_recording(&names(&["a"]), false)
            .await
            .unwrap();
        registry.request_new_set(&names(&["a"])).await;
        demote(&registry, "b").await;

        let overview = registry.status_overview().await;

        assert_eq!(overview.devices.len(), 2);
        assert_eq!(overview.devices[0].device_name, "a");
        assert_eq!(overview.devices[0].num_of_sets, 1);
        assert!(overview.devices[0].latest_set.is_some());
        assert_eq!(overview.devices[1].num_of_sets, 0);
        assert_eq!(overview.devices_not_heard_from.len(), 1);
        assert_eq!(overview.devices_not_heard_from[0].device_name, "b");

        let json = serde_json::to_value(&overview).unwrap();
        assert_eq!(json["devices"][0]["numOfSets"], 1);
        assert!(json["devicesNotHeardFrom"][0]["lastCheckIn"].is_string());
    }

    #[tokio::test]
    async fn test_reload_reproduces_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("server.db");
        let logs = Arc::new(EventLogStore::new(dir.path().join("csv")));

        {
            let registry =
                DeviceRegistry::load(Store::open(&db_path).unwrap(), Arc::clone(&logs)).unwrap();
            registry.check_in("cam").await.unwrap();
            registry
                .set_recording(&names(&["cam"]), false)
                .await
                .unwrap();
            registry.request_new_set(&names(&["cam"])).await;
            demote(&registry, "cam").await;
        }

        let registry = DeviceRegistry::load(Store::open(&db_path).unwrap(), logs).unwrap();
        let record = registry.get("cam").await.unwrap();

        assert_eq!(record.set_number, 2);
        assert!(!record.is_recording);
        assert!(!record.is_checked_in);
        assert!(record.is_new_set);
        assert!(record.latest_set_time.is_some());
    }
}
