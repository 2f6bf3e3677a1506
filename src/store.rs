//! Point-in-time event access. Every calculator reads events through `events_asof`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, info};

use crate::events::Event;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored timestamp {secs}s+{nanos}ns for user '{user_id}'")]
    InvalidTimestamp {
        user_id: String,
        secs: i64,
        nanos: i64,
    },
}

pub trait EventStore: Send + Sync {
    /// Events for `user_id` with `event_timestamp <= cutoff`, oldest first.
    /// Unknown users yield an empty vector.
    fn events_asof(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError>;

    /// Distinct user ids in first-seen order.
    fn user_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    by_user: HashMap<String, Vec<Event>>,
    order: Vec<String>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let mut store = Self::new();
        store.extend(events);
        store
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        let mut touched = Vec::new();
        for event in events {
            if !self.by_user.contains_key(&event.user_id) {
                self.order.push(event.user_id.clone());
            }
            touched.push(event.user_id.clone());
            self.by_user
                .entry(event.user_id.clone())
                .or_default()
                .push(event);
        }

        touched.sort();
        touched.dedup();
        for user_id in touched {
            if let Some(bucket) = self.by_user.get_mut(&user_id) {
                bucket.sort_by_key(|event| event.event_timestamp);
            }
        }
    }

    pub fn event_count(&self) -> usize {
        self.by_user.values().map(Vec::len).sum()
    }
}

impl EventStore for InMemoryEventStore {
    fn events_asof(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        let Some(bucket) = self.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        let end = bucket.partition_point(|event| event.event_timestamp <= cutoff);
        Ok(bucket[..end].to_vec())
    }

    fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.order.clone())
    }
}

/// File-backed store; one row per event in table `events`.
pub struct SqliteEventStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                event_ts_s INTEGER NOT NULL,
                event_ts_ns INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                session_duration_seconds REAL,
                content_category TEXT,
                donation_amount REAL
            );
            CREATE INDEX IF NOT EXISTS idx_events_user_ts ON events (user_id, event_ts_s, event_ts_ns);
            ",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn insert_events(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO events (
                    user_id,
                    event_ts_s,
                    event_ts_ns,
                    event_type,
                    session_duration_seconds,
                    content_category,
                    donation_amount
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for event in events {
                stmt.execute(params![
                    event.user_id,
                    event.event_timestamp.timestamp(),
                    i64::from(event.event_timestamp.timestamp_subsec_nanos()),
                    event.event_type,
                    event.session_duration_seconds,
                    event.content_category,
                    event.donation_amount,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.insert.finish",
            inserted = events.len()
        );
        Ok(events.len())
    }
}

impl EventStore for SqliteEventStore {
    fn events_asof(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let mut stmt = conn.prepare_cached(
            "
            SELECT
                event_ts_s,
                event_ts_ns,
                event_type,
                session_duration_seconds,
                content_category,
                donation_amount
            FROM events
            WHERE user_id = ?1
              AND (event_ts_s < ?2 OR (event_ts_s = ?2 AND event_ts_ns <= ?3))
            ORDER BY event_ts_s ASC, event_ts_ns ASC, seq ASC
            ",
        )?;

        let mut rows = stmt.query(params![
            user_id,
            cutoff.timestamp(),
            i64::from(cutoff.timestamp_subsec_nanos())
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let secs: i64 = row.get(0)?;
            let nanos: i64 = row.get(1)?;
            let event_timestamp = u32::try_from(nanos)
                .ok()
                .and_then(|subsec| Utc.timestamp_opt(secs, subsec).single())
                .ok_or_else(|| StoreError::InvalidTimestamp {
                    user_id: user_id.to_string(),
                    secs,
                    nanos,
                })?;
            out.push(Event {
                user_id: user_id.to_string(),
                event_timestamp,
                event_type: row.get(2)?,
                session_duration_seconds: row.get(3)?,
                content_category: row.get(4)?,
                donation_amount: row.get(5)?,
            });
        }

        debug!(
            component = "store",
            event = "store.events_asof",
            user_id,
            returned = out.len()
        );
        Ok(out)
    }

    fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self
            .conn
            .lock()
            .expect("sqlite connection lock should not be poisoned");
        let mut stmt = conn.prepare(
            "SELECT user_id FROM events GROUP BY user_id ORDER BY MIN(seq) ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 1, 12, 0, 0).unwrap() + Duration::days(day)
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::new("u1", ts(3), "app_open"),
            Event::new("u1", ts(0), "app_open").with_duration(30.0),
            Event::new("u2", ts(1), "quran_read").with_category("Quran"),
            Event::new("u1", ts(9), "app_open"),
        ]
    }

    #[test]
    fn in_memory_store_filters_by_cutoff_and_sorts() {
        let store = InMemoryEventStore::from_events(sample_events());
        let events = store.events_asof("u1", ts(3)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_timestamp, ts(0));
        assert_eq!(events[1].event_timestamp, ts(3));
        assert!(events.iter().all(|event| event.event_timestamp <= ts(3)));
        assert_eq!(store.user_ids().unwrap(), vec!["u1", "u2"]);
        assert_eq!(store.event_count(), 4);
    }

    #[test]
    fn unknown_user_is_empty_not_an_error() {
        let store = InMemoryEventStore::from_events(sample_events());
        assert!(store.events_asof("ghost", ts(100)).unwrap().is_empty());
    }

    #[test]
    fn sqlite_store_matches_in_memory_semantics() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.insert_events(&sample_events()).unwrap();

        let events = store.events_asof("u1", ts(3)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].session_duration_seconds, Some(30.0));
        assert_eq!(events[1].event_timestamp, ts(3));
        assert!(store.events_asof("ghost", ts(100)).unwrap().is_empty());
        assert_eq!(store.user_ids().unwrap(), vec!["u1", "u2"]);
        assert_eq!(
            store.events_asof("u2", ts(5)).unwrap()[0].content_category.as_deref(),
            Some("Quran")
        );
    }

    #[test]
    fn sub_millisecond_cutoff_agrees_across_stores() {
        let cutoff = ts(2);
        let events = vec![
            Event::new("u1", cutoff - Duration::nanoseconds(1), "app_open"),
            Event::new("u1", cutoff, "quran_read"),
            Event::new("u1", cutoff + Duration::microseconds(500), "app_open"),
            Event::new("u1", cutoff + Duration::nanoseconds(1), "lecture_view"),
        ];
        let memory = InMemoryEventStore::from_events(events.clone());
        let sqlite = SqliteEventStore::open_in_memory().unwrap();
        sqlite.insert_events(&events).unwrap();

        let from_memory = memory.events_asof("u1", cutoff).unwrap();
        let from_sqlite = sqlite.events_asof("u1", cutoff).unwrap();
        assert_eq!(from_sqlite.len(), 2);
        assert_eq!(from_sqlite, from_memory);
        assert_eq!(from_sqlite[0].event_timestamp, cutoff - Duration::nanoseconds(1));
    }
}
