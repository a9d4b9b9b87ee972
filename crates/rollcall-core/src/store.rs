//! Identity enrollment storage trait and SQLite implementation.

use crate::db::{from_micros, to_micros, Database, DbError};
use crate::types::{Encoding, EncodingError, Identity};
use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;

const DIMENSION_KEY: &str = "dimension";

/// Raw `identities` columns before the encoding blob is decoded.
type IdentityRow = (String, String, Option<String>, Vec<u8>, i64);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(#[from] EncodingError),
    #[error("invalid identity: {0}")]
    InvalidIdentity(&'static str),
    #[error("stored encoding for {identity_key} is corrupt: {source}")]
    CorruptEncoding {
        identity_key: String,
        source: EncodingError,
    },
    #[error("corrupt store metadata: {0}")]
    CorruptMetadata(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.into())
    }
}

/// Persistent set of enrolled identities.
pub trait EncodingStore: Send + Sync {
    /// Enroll a new identity. The first successful insert fixes the
    /// encoding dimensionality for the lifetime of the store.
    fn insert(
        &self,
        identity_key: &str,
        display_name: &str,
        group_attribute: Option<&str>,
        encoding: Encoding,
    ) -> Result<Identity, StoreError>;

    /// Point-in-time snapshot of every identity, in insertion order.
    fn all(&self) -> Result<Vec<Identity>, StoreError>;

    fn get(&self, identity_key: &str) -> Result<Option<Identity>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Established encoding dimensionality, if anything has been enrolled.
    fn dimension(&self) -> Result<Option<usize>, StoreError>;
}

/// SQLite-backed encoding store
#[derive(Clone, Debug)]
pub struct SqliteEncodingStore {
    db: Database,
}

impl SqliteEncodingStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_identity(row: &rusqlite::Row) -> Result<IdentityRow, rusqlite::Error> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode(
        (identity_key, display_name, group_attribute, blob, enrolled_at_us): IdentityRow,
    ) -> Result<Identity, StoreError> {
        let encoding =
            Encoding::from_bytes(&blob).map_err(|source| StoreError::CorruptEncoding {
                identity_key: identity_key.clone(),
                source,
            })?;
        Ok(Identity {
            identity_key,
            display_name,
            group_attribute,
            encoding,
            enrolled_at: from_micros(enrolled_at_us)?,
        })
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn parse_dimension(value: Option<String>) -> Result<Option<usize>, StoreError> {
    value
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| StoreError::CorruptMetadata(format!("dimension {v:?}")))
        })
        .transpose()
}

impl EncodingStore for SqliteEncodingStore {
    fn insert(
        &self,
        identity_key: &str,
        display_name: &str,
        group_attribute: Option<&str>,
        encoding: Encoding,
    ) -> Result<Identity, StoreError> {
        if identity_key.trim().is_empty() {
            return Err(StoreError::InvalidIdentity("identity key is empty"));
        }
        if display_name.trim().is_empty() {
            return Err(StoreError::InvalidIdentity("display name is empty"));
        }
        let group_attribute = group_attribute.filter(|g| !g.trim().is_empty());

        // Truncate to the stored precision so the returned record equals a re-read.
        let enrolled_at = from_micros(to_micros(Utc::now()))?;

        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let established = parse_dimension(
            tx.query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [DIMENSION_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?,
        )?;

        match established {
            Some(expected) if expected != encoding.dimension() => {
                return Err(EncodingError::WrongDimension {
                    expected,
                    actual: encoding.dimension(),
                }
                .into());
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                    params![DIMENSION_KEY, encoding.dimension().to_string()],
                )?;
            }
        }

        let inserted = tx.execute(
            "INSERT INTO identities
                 (identity_key, display_name, group_attribute, encoding, enrolled_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity_key,
                display_name,
                group_attribute,
                encoding.to_bytes(),
                to_micros(enrolled_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            // Dropping the transaction rolls back the dimension write as well.
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateIdentity(identity_key.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        tracing::info!(
            identity = identity_key,
            dimension = encoding.dimension(),
            "identity enrolled"
        );

        Ok(Identity {
            identity_key: identity_key.to_string(),
            display_name: display_name.to_string(),
            group_attribute: group_attribute.map(str::to_string),
            encoding,
            enrolled_at,
        })
    }

    fn all(&self) -> Result<Vec<Identity>, StoreError> {
        let rows = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(
                "SELECT identity_key, display_name, group_attribute, encoding, enrolled_at_us
                 FROM identities ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([], Self::row_to_identity)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(Self::decode).collect()
    }

    fn get(&self, identity_key: &str) -> Result<Option<Identity>, StoreError> {
        let row = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT identity_key, display_name, group_attribute, encoding, enrolled_at_us
                 FROM identities WHERE identity_key = ?1",
                [identity_key],
                Self::row_to_identity,
            )
            .optional()?
        };
        row.map(Self::decode).transpose()
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        let value = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [DIMENSION_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        };
        parse_dimension(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteEncodingStore {
        SqliteEncodingStore::new(Database::open_in_memory().unwrap())
    }

    fn enc(values: &[f64]) -> Encoding {
        Encoding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = store();
        let id = store
            .insert("S-001", "Ada", Some("Physics"), enc(&[0.1, 0.2, 0.3]))
            .unwrap();
        assert_eq!(id.identity_key, "S-001");
        assert_eq!(id.group_attribute.as_deref(), Some("Physics"));

        let fetched = store.get("S-001").unwrap().unwrap();
        assert_eq!(fetched, id);
        assert!(store.get("S-404").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_key_leaves_store_unchanged() {
        let store = store();
        store.insert("S-001", "Ada", None, enc(&[0.0, 0.0])).unwrap();

        let err = store
            .insert("S-001", "Impostor", None, enc(&[9.0, 9.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(ref k) if k == "S-001"));

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].display_name, "Ada");
        assert_eq!(all[0].encoding, enc(&[0.0, 0.0]));
    }

    #[test]
    fn test_first_insert_fixes_dimension() {
        let store = store();
        assert_eq!(store.dimension().unwrap(), None);
        store.insert("a", "A", None, enc(&[0.0, 0.0])).unwrap();
        assert_eq!(store.dimension().unwrap(), Some(2));

        let err = store.insert("b", "B", None, enc(&[0.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidEncoding(EncodingError::WrongDimension { expected: 2, actual: 3 })
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_failed_first_insert_does_not_fix_dimension() {
        let store = store();
        assert!(store.insert("", "Nobody", None, enc(&[1.0])).is_err());
        assert_eq!(store.dimension().unwrap(), None);
        store.insert("a", "A", None, enc(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(store.dimension().unwrap(), Some(3));
    }

    #[test]
    fn test_all_is_insertion_ordered_snapshot() {
        let store = store();
        for key in ["zeta", "alpha", "mid"] {
            store.insert(key, key, None, enc(&[1.0])).unwrap();
        }
        let snapshot = store.all().unwrap();
        store.insert("late", "late", None, enc(&[2.0])).unwrap();

        let keys: Vec<_> = snapshot.iter().map(|i| i.identity_key.as_str()).collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
        assert_eq!(store.all().unwrap().len(), 4);
    }

    #[test]
    fn test_empty_group_is_none() {
        let store = store();
        let id = store.insert("a", "A", Some("  "), enc(&[1.0])).unwrap();
        assert_eq!(id.group_attribute, None);
    }

    #[test]
    fn test_blank_display_name_rejected() {
        let err = store().insert("a", " ", None, enc(&[1.0])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentity(_)));
    }

    #[test]
    fn test_dimension_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        {
            let store = SqliteEncodingStore::new(Database::open(&path).unwrap());
            store.insert("a", "A", None, enc(&[0.5; 4])).unwrap();
        }
        let store = SqliteEncodingStore::new(Database::open(&path).unwrap());
        assert_eq!(store.dimension().unwrap(), Some(4));
        assert_eq!(store.all().unwrap()[0].encoding, enc(&[0.5; 4]));
        assert!(store.insert("b", "B", None, enc(&[0.5; 3])).is_err());
    }

    #[test]
    fn test_concurrent_duplicate_inserts_admit_one() {
        let store = std::sync::Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .insert("same", &format!("attempt {i}"), None, enc(&[i as f64]))
                        .is_ok()
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(store.count().unwrap(), 1);
    }
}
