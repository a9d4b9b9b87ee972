//! Operator credentials and the report-access capability.
//!
//! Reading the full attendance report requires a [`ReportAccess`] token,
//! which only [`OperatorRegistry::authenticate`] can mint. There is no
//! process-wide "logged in" state: dropping the token is logging out.

use crate::db::{to_micros, Database, DbError};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, ErrorCode, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;

const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 rounds applied to newly stored passwords.
pub const DEFAULT_KDF_ROUNDS: u32 = 600_000;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("operator already exists: {0}")]
    DuplicateOperator(String),
    #[error("username and password are required")]
    MissingCredentials,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e.into())
    }
}

/// Proof that an operator authenticated. Required for report export.
#[derive(Debug, Clone)]
pub struct ReportAccess {
    operator: String,
}

impl ReportAccess {
    pub fn operator(&self) -> &str {
        &self.operator
    }
}

/// SQLite-backed operator accounts with salted PBKDF2 password digests.
#[derive(Clone, Debug)]
pub struct OperatorRegistry {
    db: Database,
    rounds: u32,
}

fn derive(salt: &[u8], password: &str, rounds: u32) -> Vec<u8> {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out.to_vec()
}

/// Single-pass digest written before schema v3. Only ever verified.
fn legacy_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Compare without short-circuiting on the first differing byte.
fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl OperatorRegistry {
    pub fn new(db: Database) -> Self {
        Self::with_rounds(db, DEFAULT_KDF_ROUNDS)
    }

    /// Registry that hashes new passwords with `rounds` PBKDF2 iterations.
    /// Existing rows keep verifying with the count stored alongside them.
    pub fn with_rounds(db: Database, rounds: u32) -> Self {
        Self {
            db,
            rounds: rounds.max(1),
        }
    }

    pub fn add(&self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let salt = new_salt();
        let hashed = derive(&salt, password, self.rounds);

        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO operators (username, salt, digest, iterations, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                salt.to_vec(),
                hashed,
                self.rounds,
                to_micros(Utc::now())
            ],
        );
        match inserted {
            Ok(_) => {
                tracing::info!(operator = username, rounds = self.rounds, "operator added");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(AuthError::DuplicateOperator(username.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check a password and mint a [`ReportAccess`] token.
    ///
    /// Unknown users and wrong passwords produce the same error. A legacy
    /// single-pass digest is replaced with a PBKDF2 one once it verifies.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ReportAccess, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let stored: Option<(Vec<u8>, Vec<u8>, Option<i64>)> = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT salt, digest, iterations FROM operators WHERE username = ?1",
                [username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };

        let verified = match &stored {
            Some((salt, expected, Some(rounds))) => match u32::try_from(*rounds) {
                Ok(rounds) if rounds > 0 => {
                    digests_equal(&derive(salt, password, rounds), expected)
                }
                _ => {
                    tracing::warn!(operator = username, rounds, "stored round count is invalid");
                    false
                }
            },
            Some((salt, expected, None)) => {
                digests_equal(&legacy_digest(salt, password), expected)
            }
            None => false,
        };

        if !verified {
            tracing::warn!(operator = username, "operator authentication failed");
            return Err(AuthError::InvalidCredentials);
        }

        if matches!(stored, Some((_, _, None))) {
            self.rehash(username, password)?;
        }

        tracing::info!(operator = username, "operator authenticated");
        Ok(ReportAccess {
            operator: username.to_string(),
        })
    }

    fn rehash(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let salt = new_salt();
        let hashed = derive(&salt, password, self.rounds);
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE operators SET salt = ?2, digest = ?3, iterations = ?4 WHERE username = ?1",
            params![username, salt.to_vec(), hashed, self.rounds],
        )?;
        tracing::info!(
            operator = username,
            rounds = self.rounds,
            "legacy password digest upgraded"
        );
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, AuthError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT username FROM operators ORDER BY username")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ROUNDS: u32 = 1_000;

    fn registry() -> OperatorRegistry {
        OperatorRegistry::with_rounds(Database::open_in_memory().unwrap(), TEST_ROUNDS)
    }

    fn stored_row(ops: &OperatorRegistry, username: &str) -> (Vec<u8>, Vec<u8>, Option<i64>) {
        ops.db
            .lock()
            .unwrap()
            .query_row(
                "SELECT salt, digest, iterations FROM operators WHERE username = ?1",
                [username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap()
    }

    #[test]
    fn test_add_and_authenticate() {
        let ops = registry();
        ops.add("grace", "hopper").unwrap();
        let access = ops.authenticate("grace", "hopper").unwrap();
        assert_eq!(access.operator(), "grace");
    }

    #[test]
    fn test_wrong_password_and_unknown_user_look_the_same() {
        let ops = registry();
        ops.add("grace", "hopper").unwrap();
        let wrong = ops.authenticate("grace", "cobol").unwrap_err();
        let unknown = ops.authenticate("alan", "turing").unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, AuthError::InvalidCredentials));
    }

    #[test]
    fn test_duplicate_operator() {
        let ops = registry();
        ops.add("grace", "hopper").unwrap();
        let err = ops.add("grace", "other").unwrap_err();
        assert!(matches!(err, AuthError::DuplicateOperator(_)));
        // First password still works.
        assert!(ops.authenticate("grace", "hopper").is_ok());
    }

    #[test]
    fn test_missing_credentials() {
        let ops = registry();
        assert!(matches!(ops.add("", "pw"), Err(AuthError::MissingCredentials)));
        assert!(matches!(ops.add("u", ""), Err(AuthError::MissingCredentials)));
        assert!(matches!(
            ops.authenticate("u", ""),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn test_salts_differ_per_operator() {
        let ops = registry();
        ops.add("a", "same").unwrap();
        ops.add("b", "same").unwrap();
        let conn = ops.db.lock().unwrap();
        let digests: Vec<Vec<u8>> = conn
            .prepare("SELECT digest FROM operators")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_ne!(digests[0], digests[1]);
    }

    #[test]
    fn test_list_is_sorted() {
        let ops = registry();
        ops.add("zed", "pw").unwrap();
        ops.add("amy", "pw").unwrap();
        assert_eq!(ops.list().unwrap(), ["amy", "zed"]);
    }

    #[test]
    fn test_digest_comparison() {
        assert!(digests_equal(b"abc", b"abc"));
        assert!(!digests_equal(b"abc", b"abd"));
        assert!(!digests_equal(b"abc", b"ab"));
    }

    #[test]
    fn test_stored_digest_is_iterated() {
        let ops = registry();
        ops.add("grace", "hopper").unwrap();
        let (salt, digest, rounds) = stored_row(&ops, "grace");
        assert_eq!(rounds, Some(i64::from(TEST_ROUNDS)));
        assert_eq!(digest.len(), DIGEST_LEN);
        assert_ne!(digest, legacy_digest(&salt, "hopper"));
        assert_eq!(digest, derive(&salt, "hopper", TEST_ROUNDS));
    }

    #[test]
    fn test_default_rounds() {
        let ops = OperatorRegistry::new(Database::open_in_memory().unwrap());
        assert_eq!(ops.rounds, DEFAULT_KDF_ROUNDS);
        assert_eq!(OperatorRegistry::with_rounds(ops.db, 0).rounds, 1);
    }

    #[test]
    fn test_legacy_digest_is_upgraded_on_login() {
        let ops = registry();
        let salt = new_salt();
        ops.db
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO operators (username, salt, digest, created_at_us)
                 VALUES ('ada', ?1, ?2, 0)",
                params![salt.to_vec(), legacy_digest(&salt, "lovelace")],
            )
            .unwrap();

        assert!(matches!(
            ops.authenticate("ada", "babbage"),
            Err(AuthError::InvalidCredentials)
        ));
        assert_eq!(stored_row(&ops, "ada").2, None);

        ops.authenticate("ada", "lovelace").unwrap();
        let (new_salt, digest, rounds) = stored_row(&ops, "ada");
        assert_eq!(rounds, Some(i64::from(TEST_ROUNDS)));
        assert_ne!(new_salt, salt.to_vec());
        assert_eq!(digest, derive(&new_salt, "lovelace", TEST_ROUNDS));
        assert!(ops.authenticate("ada", "lovelace").is_ok());
    }
}
