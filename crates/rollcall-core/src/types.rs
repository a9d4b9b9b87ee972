use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one persisted encoding component (little-endian f64).
const COMPONENT_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("encoding is empty")]
    Empty,
    #[error("encoding component {index} is not finite")]
    NonFinite { index: usize },
    #[error("encoding has {actual} components, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("encoding blob of {len} bytes is not a whole number of f64 components")]
    Truncated { len: usize },
}

/// Face encoding vector produced by an external embedding model
/// (typically 128-dimensional).
///
/// Construction validates that the vector is non-empty and every component
/// is finite, so distance computations never see NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Encoding {
    values: Vec<f64>,
}

impl Encoding {
    pub fn new(values: Vec<f64>) -> Result<Self, EncodingError> {
        if values.is_empty() {
            return Err(EncodingError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EncodingError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two encodings.
    ///
    /// Callers are responsible for checking that dimensions agree; extra
    /// components on either side are ignored.
    pub fn distance(&self, other: &Encoding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Serialize to the on-disk BLOB layout: consecutive little-endian f64s.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * COMPONENT_BYTES);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode the BLOB layout written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() % COMPONENT_BYTES != 0 {
            return Err(EncodingError::Truncated { len: bytes.len() });
        }
        let values = bytes
            .chunks_exact(COMPONENT_BYTES)
            .map(|chunk| {
                let mut buf = [0u8; COMPONENT_BYTES];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();
        Self::new(values)
    }
}

impl TryFrom<Vec<f64>> for Encoding {
    type Error = EncodingError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Encoding> for Vec<f64> {
    fn from(encoding: Encoding) -> Self {
        encoding.values
    }
}

/// An enrolled identity with its reference encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Externally assigned unique key (e.g. institutional ID).
    pub identity_key: String,
    pub display_name: String,
    /// Optional classification tag such as a department.
    pub group_attribute: Option<String>,
    pub encoding: Encoding,
    pub enrolled_at: DateTime<Utc>,
}

/// One row of the append-only attendance ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Ledger sequence number, increasing in append order.
    pub id: i64,
    pub identity_key: String,
    pub timestamp: DateTime<Utc>,
}

/// An attendance event joined with the identity it belongs to, for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRow {
    pub identity_key: String,
    pub display_name: String,
    pub group_attribute: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of matching a probe encoding against enrolled identities.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { identity: Identity, distance: f64 },
    NoMatch,
}

/// Result of a ledger append.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordResult {
    Recorded(AttendanceEvent),
    /// The identity already has an event inside the duplicate window.
    Suppressed,
}

/// Terminal state of a single probe submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Recorded {
        identity: Identity,
        event: AttendanceEvent,
        distance: f64,
    },
    SuppressedDuplicate {
        identity: Identity,
        distance: f64,
    },
    NoMatchFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_rejects_empty() {
        assert_eq!(Encoding::new(vec![]), Err(EncodingError::Empty));
    }

    #[test]
    fn test_encoding_rejects_nan() {
        let err = Encoding::new(vec![0.0, f64::NAN, 1.0]).unwrap_err();
        assert_eq!(err, EncodingError::NonFinite { index: 1 });
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Encoding::new(vec![0.0, 0.0]).unwrap();
        let b = Encoding::new(vec![3.0, 4.0]).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_blob_layout_is_little_endian_f64() {
        let enc = Encoding::new(vec![1.0, -2.5]).unwrap();
        let bytes = enc.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &1.0f64.to_le_bytes());
        assert_eq!(Encoding::from_bytes(&bytes).unwrap(), enc);
    }

    #[test]
    fn test_blob_with_partial_component_is_rejected() {
        let err = Encoding::from_bytes(&[0u8; 12]).unwrap_err();
        assert_eq!(err, EncodingError::Truncated { len: 12 });
    }

    #[test]
    fn test_encoding_deserialize_validates() {
        let ok: Encoding = serde_json::from_str("[0.5, 1.5]").unwrap();
        assert_eq!(ok.dimension(), 2);
        assert!(serde_json::from_str::<Encoding>("[]").is_err());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(Outcome::NoMatchFound).unwrap();
        assert_eq!(json["outcome"], "no_match_found");
    }
}
