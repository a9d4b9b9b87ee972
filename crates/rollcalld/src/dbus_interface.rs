use chrono::Utc;
use rollcall_core::{
    AttendanceLedger, AuthError, Encoding, EncodingStore, OperatorRegistry, ServiceError,
    SqliteAttendanceService,
};
use std::sync::Arc;
use std::time::Duration;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.freedesktop.Rollcall1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
pub struct RollcallService {
    service: Arc<SqliteAttendanceService>,
    operators: OperatorRegistry,
    timeout: Duration,
}

impl RollcallService {
    pub fn new(
        service: SqliteAttendanceService,
        operators: OperatorRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            service: Arc::new(service),
            operators,
            timeout,
        }
    }

    /// Run store work on the blocking pool, bounded by the request timeout.
    ///
    /// A timed-out request still runs to completion in the background; only
    /// the reply is abandoned.
    async fn run_blocking<T, F>(&self, op: &'static str, work: F) -> fdo::Result<T>
    where
        F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(work);
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(to_fdo_error(op, e)),
            Ok(Err(join)) => {
                tracing::error!(op, error = %join, "worker task failed");
                Err(fdo::Error::Failed(format!("{op}: worker task failed")))
            }
            Err(_) => {
                tracing::warn!(op, timeout_secs = self.timeout.as_secs(), "request timed out");
                Err(fdo::Error::Timeout(format!("{op} timed out")))
            }
        }
    }
}

/// Map a service error onto the closest standard D-Bus error.
fn to_fdo_error(op: &str, e: ServiceError) -> fdo::Error {
    match &e {
        ServiceError::Auth(AuthError::InvalidCredentials | AuthError::MissingCredentials) => {
            tracing::warn!(op, "access denied");
            fdo::Error::AccessDenied(e.to_string())
        }
        _ if e.is_precondition() => {
            tracing::warn!(op, error = %e, "request rejected");
            fdo::Error::InvalidArgs(e.to_string())
        }
        _ => {
            tracing::error!(op, error = %e, "request failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization: {e}")))
}

/// D-Bus has no optional strings; an empty argument means "not given".
fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity with its reference encoding.
    async fn enroll(
        &self,
        identity_key: String,
        display_name: String,
        group: String,
        encoding: Vec<f64>,
    ) -> fdo::Result<String> {
        tracing::info!(identity = %identity_key, dimension = encoding.len(), "enroll requested");
        let service = self.service.clone();
        let identity = self
            .run_blocking("enroll", move || {
                let encoding = Encoding::new(encoding)?;
                service.enroll(
                    &identity_key,
                    &display_name,
                    non_empty(group).as_deref(),
                    encoding,
                )
            })
            .await?;
        to_json(&identity)
    }

    /// Match a probe encoding and record attendance at the current time.
    async fn submit(&self, encoding: Vec<f64>) -> fdo::Result<String> {
        tracing::debug!(dimension = encoding.len(), "submit requested");
        let service = self.service.clone();
        let outcome = self
            .run_blocking("submit", move || {
                let probe = Encoding::new(encoding)?;
                service.submit(&probe, Utc::now())
            })
            .await?;
        to_json(&outcome)
    }

    /// Attendance events, newest first. Empty key returns every identity.
    async fn attendance_records(&self, identity_key: String) -> fdo::Result<String> {
        let service = self.service.clone();
        let events = self
            .run_blocking("attendance_records", move || {
                service.history(non_empty(identity_key).as_deref())
            })
            .await?;
        to_json(&events)
    }

    /// Operator-only attendance report joined with identity details.
    async fn export_attendance(
        &self,
        username: String,
        password: String,
        identity_key: String,
    ) -> fdo::Result<String> {
        tracing::info!(operator = %username, "export requested");
        let service = self.service.clone();
        let operators = self.operators.clone();
        let rows = self
            .run_blocking("export_attendance", move || {
                let access = operators.authenticate(&username, &password)?;
                service.export(&access, non_empty(identity_key).as_deref())
            })
            .await?;
        to_json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let service = self.service.clone();
        let (identities, dimension) = self
            .run_blocking("status", move || {
                let store = service.store();
                Ok((store.count()?, store.dimension()?))
            })
            .await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": identities,
            "dimension": dimension,
            "match_threshold": self.service.matcher().threshold(),
            "duplicate_window": self.service.ledger().window().describe(),
        })
        .to_string())
    }
}
