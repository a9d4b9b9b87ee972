//! Schema migrations, tracked with SQLite's `user_version` pragma.

use crate::db::DbError;
use rusqlite::Connection;

/// SQL for each migration version
const MIGRATIONS: &[(&str, &str)] = &[
    ("v001_initial", include_str!("v001_initial.sql")),
    ("v002_operators", include_str!("v002_operators.sql")),
    ("v003_operator_kdf", include_str!("v003_operator_kdf.sql")),
];

/// Runs database migrations
pub struct Migrator<'a> {
    conn: &'a Connection,
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get current schema version
    pub fn current_version(&self) -> Result<i32, DbError> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    /// Latest schema version known to this build.
    pub fn target_version(&self) -> i32 {
        MIGRATIONS.len() as i32
    }

    /// Run all pending migrations
    pub fn migrate(&self) -> Result<(), DbError> {
        let current = self.current_version()?;
        let target = self.target_version();

        if current > target {
            return Err(DbError::Migration(format!(
                "database schema v{current} is newer than supported v{target}"
            )));
        }

        for (idx, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i32;
            if version > current {
                tracing::info!(version, name, "running migration");
                self.conn
                    .execute_batch(sql)
                    .map_err(|e| DbError::Migration(format!("{name}: {e}")))?;
                self.conn.pragma_update(None, "user_version", version)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn);

        assert_eq!(migrator.current_version().unwrap(), 0);
        migrator.migrate().unwrap();
        assert_eq!(
            migrator.current_version().unwrap(),
            migrator.target_version()
        );
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn);
        migrator.migrate().unwrap();
        migrator.migrate().unwrap();
        assert_eq!(migrator.current_version().unwrap(), 3);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        let err = Migrator::new(&conn).migrate().unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }
}
