/// Miner-facing wire types
///
/// Work replies, solution bodies and error codes for the mining API.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::shares::Solution;

/// Length of an Ergo P2PK address used as login
pub const LOGIN_LEN: usize = 51;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl ErrorReply {
    pub const WORK_NOT_READY: i32 = 0;
    pub const MALFORMED: i32 = -1;
    pub const METHOD_NOT_FOUND: i32 = -3;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const INVALID_SHARE: i32 = 23;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn work_not_ready() -> Self {
        Self::new(Self::WORK_NOT_READY, "Work not ready")
    }

    pub fn malformed() -> Self {
        Self::new(Self::MALFORMED, "Malformed request")
    }

    pub fn rate_limited() -> Self {
        Self::new(Self::MALFORMED, "High rate of invalid shares")
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn invalid_share() -> Self {
        Self::new(Self::INVALID_SHARE, "Invalid share")
    }
}

/// Reply of the work-fetch operation.
#[derive(Debug, Clone, Serialize)]
pub struct WorkReply {
    pub msg: String,
    /// Share target, emitted as a bare JSON number
    #[serde(serialize_with = "serialize_numeral")]
    pub b: BigUint,
    pub pk: String,
}

fn serialize_numeral<S: Serializer>(value: &BigUint, s: S) -> Result<S::Ok, S::Error> {
    let raw = RawValue::from_string(value.to_string()).map_err(serde::ser::Error::custom)?;
    raw.serialize(s)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("field d is not a number")]
    NotANumber,
}

#[derive(Deserialize)]
struct SolutionParams {
    pk: Option<String>,
    w: Option<String>,
    n: Option<String>,
    d: Option<Box<RawValue>>,
    #[serde(default)]
    msg: Option<String>,
}

/// Parse a `{pk, w, n, d[, msg]}` body.
pub fn parse_solution(body: &[u8]) -> Result<Solution, ProtocolError> {
    let params: SolutionParams = serde_json::from_slice(body)?;

    let pk = params.pk.ok_or(ProtocolError::Missing("pk"))?;
    let w = params.w.ok_or(ProtocolError::Missing("w"))?;
    let n = params.n.ok_or(ProtocolError::Missing("n"))?;
    let d = params.d.ok_or(ProtocolError::Missing("d"))?;
    if serde_json::from_str::<serde_json::Number>(d.get()).is_err() {
        return Err(ProtocolError::NotANumber);
    }

    Ok(Solution {
        pk,
        w,
        n,
        d,
        msg: params.msg.filter(|m| !m.is_empty()),
    })
}

/// Logins must be an alphanumeric P2PK address.
pub fn is_valid_login(login: &str) -> bool {
    login.len() == LOGIN_LEN && login.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Worker id as recorded; anything outside `[0-9a-zA-Z-_]{1,4}` is `unknown`.
pub fn worker_id(id: Option<&str>) -> String {
    match id {
        Some(id)
            if (1..=4).contains(&id.len())
                && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') =>
        {
            id.to_string()
        }
        _ => "unknown".to_string(),
    }
}
