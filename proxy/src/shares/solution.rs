use serde::Serialize;
use serde_json::value::RawValue;

/// A proof-of-work submission as forwarded to the node.
///
/// `d` is kept as the raw JSON numeral the miner sent; it routinely
/// exceeds 64 bits and the node expects it back verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct Solution {
    pub pk: String,
    pub w: String,
    pub n: String,
    pub d: Box<RawValue>,
    /// Header the solution was mined against, if the miner named one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Solution {
    /// Identity used for duplicate detection.
    pub fn share_key(&self) -> String {
        format!("{}:{}", self.n, self.w)
    }

    pub fn distance(&self) -> &str {
        self.d.get()
    }
}

/// Who submitted a share.
#[derive(Debug, Clone)]
pub struct Submitter {
    pub login: String,
    pub worker: String,
    pub ip: String,
}
