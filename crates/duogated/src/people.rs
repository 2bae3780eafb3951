//! SQLite-backed person directory.

use duogate_core::{BiometricTemplate, LookupError, Person, PersonLookup};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Person records keyed by badge id.
pub struct SqlitePersonStore {
    conn: Mutex<Connection>,
}

impl SqlitePersonStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS people (
                badge TEXT PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                embed TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the record for `badge`.
    pub fn upsert_person(
        &self,
        badge: &str,
        first_name: &str,
        last_name: &str,
        template: Option<&BiometricTemplate>,
    ) -> Result<(), StoreError> {
        let embed = template.map(BiometricTemplate::to_pg_array);
        self.conn.lock().execute(
            "INSERT INTO people (badge, first_name, last_name, embed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(badge) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                embed = excluded.embed",
            params![badge, first_name, last_name, embed],
        )?;
        tracing::info!(badge, has_template = embed.is_some(), "person stored");
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM people", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl PersonLookup for SqlitePersonStore {
    fn find_person_by_badge(&self, badge: &str) -> Result<Option<Person>, LookupError> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT first_name, last_name, embed FROM people WHERE badge = ?1",
                params![badge],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| LookupError::Query(e.to_string()))?;

        let Some((first_name, last_name, embed)) = row else {
            return Ok(None);
        };

        // A corrupt template is treated as absent, never as a match.
        let template = embed.and_then(|text| match BiometricTemplate::parse(&text) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(badge, error = %e, "stored face template is unreadable");
                None
            }
        });

        Ok(Some(Person {
            badge: badge.to_string(),
            first_name,
            last_name,
            template,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_unknown_badge() {
        let store = SqlitePersonStore::open_in_memory().unwrap();
        assert!(store.find_person_by_badge("nobody").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_lookup() {
        let store = SqlitePersonStore::open_in_memory().unwrap();
        let template = BiometricTemplate::from_raw(vec![3.0, 4.0]).unwrap();
        store
            .upsert_person("E1234", "First", "Last", Some(&template))
            .unwrap();

        let person = store.find_person_by_badge("E1234").unwrap().unwrap();
        assert_eq!(person.display_name(), "First Last");
        let stored = person.template.unwrap();
        assert!((stored.similarity(&template).unwrap() - 1.0).abs() < 1e-5);

        store.upsert_person("E1234", "New", "Name", None).unwrap();
        let person = store.find_person_by_badge("E1234").unwrap().unwrap();
        assert_eq!(person.first_name, "New");
        assert!(person.template.is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_json_template_text_accepted() {
        let store = SqlitePersonStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO people (badge, first_name, last_name, embed) VALUES ('J1', 'A', 'B', '[0.0, 2.0]')",
                [],
            )
            .unwrap();
        let person = store.find_person_by_badge("J1").unwrap().unwrap();
        assert_eq!(person.template.unwrap().values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_corrupt_template_fails_closed() {
        let store = SqlitePersonStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO people (badge, first_name, last_name, embed) VALUES ('C1', 'A', 'B', 'garbage')",
                [],
            )
            .unwrap();
        let person = store.find_person_by_badge("C1").unwrap().unwrap();
        assert!(person.template.is_none());
    }
}
