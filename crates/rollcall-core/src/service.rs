//! Probe submission: match against enrolled identities, then record attendance.

use crate::config::{Config, ConfigError};
use crate::db::Database;
use crate::ledger::{AttendanceLedger, LedgerError, SqliteAttendanceLedger};
use crate::matcher::{EuclideanMatcher, MatchError, Matcher};
use crate::operators::{AuthError, ReportAccess};
use crate::store::{EncodingStore, SqliteEncodingStore, StoreError};
use crate::types::{
    AttendanceEvent, AttendanceRow, Encoding, EncodingError, Identity, MatchResult, Outcome,
    RecordResult,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServiceError {
    /// True for rejections caused by the request itself rather than a fault
    /// in the backing store.
    pub fn is_precondition(&self) -> bool {
        match self {
            Self::Encoding(_) | Self::Match(_) => true,
            Self::Store(e) => matches!(
                e,
                StoreError::DuplicateIdentity(_)
                    | StoreError::InvalidEncoding(_)
                    | StoreError::InvalidIdentity(_)
            ),
            Self::Ledger(e) => matches!(
                e,
                LedgerError::UnknownIdentity(_) | LedgerError::NonMonotonic { .. }
            ),
            Self::Auth(e) => !matches!(e, AuthError::Db(_)),
            Self::Config(_) => false,
        }
    }
}

/// Orchestrates the matcher and the ledger for single probe requests.
pub struct AttendanceService<S, L, M = EuclideanMatcher> {
    store: S,
    ledger: L,
    matcher: M,
}

/// The service wired to SQLite, as used by the daemon and the CLI.
pub type SqliteAttendanceService =
    AttendanceService<SqliteEncodingStore, SqliteAttendanceLedger, EuclideanMatcher>;

impl SqliteAttendanceService {
    /// Build the store, ledger and matcher described by `config` on `db`.
    pub fn from_config(db: Database, config: &Config) -> Result<Self, ServiceError> {
        let matcher = EuclideanMatcher::new(config.match_threshold)?;
        let window = config.window()?;
        tracing::debug!(
            threshold = matcher.threshold(),
            window = %window.describe(),
            "attendance service configured"
        );
        Ok(Self::new(
            SqliteEncodingStore::new(db.clone()),
            SqliteAttendanceLedger::new(db, window),
            matcher,
        ))
    }
}

impl<S, L, M> AttendanceService<S, L, M>
where
    S: EncodingStore,
    L: AttendanceLedger,
    M: Matcher,
{
    pub fn new(store: S, ledger: L, matcher: M) -> Self {
        Self {
            store,
            ledger,
            matcher,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    pub fn enroll(
        &self,
        identity_key: &str,
        display_name: &str,
        group_attribute: Option<&str>,
        encoding: Encoding,
    ) -> Result<Identity, ServiceError> {
        Ok(self
            .store
            .insert(identity_key, display_name, group_attribute, encoding)?)
    }

    /// Resolve `probe` and record attendance for the matched identity.
    ///
    /// `NoMatchFound` and `SuppressedDuplicate` are outcomes, not errors.
    /// Nothing is retried; the ledger append is the only side effect.
    pub fn submit(
        &self,
        probe: &Encoding,
        timestamp: DateTime<Utc>,
    ) -> Result<Outcome, ServiceError> {
        let candidates = self.store.all()?;
        let (identity, distance) = match self.matcher.resolve(probe, &candidates)? {
            MatchResult::Matched { identity, distance } => (identity, distance),
            MatchResult::NoMatch => {
                tracing::info!(candidates = candidates.len(), "probe matched no identity");
                return Ok(Outcome::NoMatchFound);
            }
        };
        tracing::debug!(identity = %identity.identity_key, distance, "probe matched");

        Ok(match self.ledger.record(&identity, timestamp)? {
            RecordResult::Recorded(event) => Outcome::Recorded {
                identity,
                event,
                distance,
            },
            RecordResult::Suppressed => Outcome::SuppressedDuplicate { identity, distance },
        })
    }

    pub fn history(
        &self,
        identity_key: Option<&str>,
    ) -> Result<Vec<AttendanceEvent>, ServiceError> {
        Ok(self.ledger.history(identity_key)?)
    }

    /// Full attendance report; requires an authenticated operator.
    pub fn export(
        &self,
        access: &ReportAccess,
        identity_key: Option<&str>,
    ) -> Result<Vec<AttendanceRow>, ServiceError> {
        let rows = self.ledger.report(identity_key)?;
        tracing::info!(operator = access.operator(), rows = rows.len(), "attendance exported");
        Ok(rows)
    }
}
