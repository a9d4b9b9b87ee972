//! rollcall-core — Face-encoding matching and attendance recording engine.
//!
//! Resolves a probe encoding to the nearest enrolled identity under a
//! distance threshold, then appends to an attendance ledger that suppresses
//! repeat events inside a duplicate window. Backed by SQLite.

pub mod config;
pub mod db;
pub mod ledger;
pub mod matcher;
mod migrations;
pub mod operators;
pub mod service;
pub mod store;
pub mod types;
pub mod window;

pub use config::{BusKind, Config, ConfigError, WindowKind};
pub use db::{Database, DbError};
pub use ledger::{AttendanceLedger, LedgerError, SqliteAttendanceLedger};
pub use matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use operators::{AuthError, OperatorRegistry, ReportAccess};
pub use service::{AttendanceService, ServiceError, SqliteAttendanceService};
pub use store::{EncodingStore, SqliteEncodingStore, StoreError};
pub use types::{
    AttendanceEvent, AttendanceRow, Encoding, EncodingError, Identity, MatchResult, Outcome,
    RecordResult,
};
pub use window::DuplicateWindow;
