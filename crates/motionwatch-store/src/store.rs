//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use motionwatch_types::DeviceRecord;

use crate::error::{Error, Result};
use crate::schema;

/// Durable table of device rows.
///
/// The registry writes every committed mutation through this trait and loads
/// the full table once at startup. Each call is one transaction.
pub trait DeviceStore: Send {
    /// Insert or replace the row for `record.name`.
    fn upsert_device(&self, record: &DeviceRecord) -> Result<()>;

    /// Insert or replace several rows. Either every row is written or none is.
    fn upsert_devices(&self, records: &[DeviceRecord]) -> Result<()>;

    /// Load every stored device.
    fn load_devices(&self) -> Result<Vec<DeviceRecord>>;
}

/// SQLite-based store for device state.
pub struct Store {
    conn: Connection,
}

const DEVICE_COLUMNS: &str = "name, set_number, latest_set_time, latest_check_in_time,
     is_new_set, is_recording, is_checked_in";

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

impl DeviceStore for Store {
    fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        write_device(&tx, record)?;
        tx.commit()?;

        debug!(
            "Persisted {}: set={}, recording={}, new_set={}, checked_in={}",
            record.name,
            record.set_number,
            record.is_recording,
            record.is_new_set,
            record.is_checked_in
        );

        Ok(())
    }

    fn upsert_devices(&self, records: &[DeviceRecord]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for record in records {
            write_device(&tx, record)?;
        }
        tx.commit()?;

        debug!("Persisted {} device(s) in one transaction", records.len());
        Ok(())
    }

    fn load_devices(&self) -> Result<Vec<DeviceRecord>> {
        let sql = format!("SELECT {} FROM device_status ORDER BY name", DEVICE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;

        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        info!("Loaded {} device(s) from database", devices.len());
        Ok(devices)
    }
}

fn write_device(conn: &Connection, record: &DeviceRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO device_status (name, set_number, latest_set_time, latest_check_in_time,
         is_new_set, is_recording, is_checked_in)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name) DO UPDATE SET
            set_number = ?2,
            latest_set_time = ?3,
            latest_check_in_time = ?4,
            is_new_set = ?5,
            is_recording = ?6,
            is_checked_in = ?7",
        rusqlite::params![
            record.name,
            record.set_number,
            record.latest_set_time.map(OffsetDateTime::unix_timestamp),
            record.latest_check_in_time.unix_timestamp(),
            record.is_new_set,
            record.is_recording,
            record.is_checked_in,
        ],
    )?;
    Ok(())
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        name: row.get(0)?,
        set_number: row.get(1)?,
        latest_set_time: row
            .get::<_, Option<i64>>(2)?
            .map(|ts| timestamp(2, ts))
            .transpose()?,
        latest_check_in_time: timestamp(3, row.get(3)?)?,
        is_new_set: row.get(4)?,
        is_recording: row.get(5)?,
        is_checked_in: row.get(6)?,
    })
}

fn timestamp(column: usize, ts: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            Box::new(Error::InvalidTimestamp(ts)),
        )
    })
}
