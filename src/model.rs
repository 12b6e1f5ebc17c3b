use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::TrackerError;

/// Content identifier in its canonical string form.
///
/// Accepts CIDv0 (bare base58btc sha2-256 multihash, `Qm...`) and CIDv1
/// (multibase-prefixed, version varint `1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    pub fn parse(s: &str) -> Result<Self, TrackerError> {
        let s = s.trim();
        let invalid = || TrackerError::InvalidCid(s.to_string());

        if s.len() == 46 && s.starts_with("Qm") {
            // v0 has no multibase prefix, it is always base58btc
            let (_, bytes) = multibase::decode(format!("z{s}")).map_err(|_| invalid())?;
            if bytes.len() == 34 && bytes[0] == 0x12 && bytes[1] == 0x20 {
                return Ok(Self(s.to_string()));
            }
            return Err(invalid());
        }

        let (_, bytes) = multibase::decode(s).map_err(|_| invalid())?;
        match bytes.first() {
            Some(0x01) if bytes.len() > 3 => Ok(Self(s.to_string())),
            _ => Err(invalid()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Cid {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to pin a CID on this node.
///
/// Replication factors of `-1` mean "pin everywhere". They are carried for the
/// caller's benefit; the tracker only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub cid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "everywhere")]
    pub replication_factor_min: i32,
    #[serde(default = "everywhere")]
    pub replication_factor_max: i32,
}

fn everywhere() -> i32 {
    -1
}

impl Pin {
    pub fn new(cid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            name: None,
            replication_factor_min: -1,
            replication_factor_max: -1,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn validate(&self) -> Result<Cid, TrackerError> {
        let cid = Cid::parse(&self.cid)?;
        let (min, max) = (self.replication_factor_min, self.replication_factor_max);
        if min < -1 || max < -1 {
            return Err(TrackerError::InvalidPin(format!(
                "replication factors must be >= -1 (min={min}, max={max})"
            )));
        }
        if min >= 0 && max >= 0 && min > max {
            return Err(TrackerError::InvalidPin(format!(
                "replication_factor_min {min} exceeds replication_factor_max {max}"
            )));
        }
        Ok(cid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Unpinned,
    PinQueued,
    Pinning,
    Pinned,
    PinError,
    UnpinQueued,
    Unpinning,
    UnpinError,
}

impl TrackerStatus {
    pub fn is_error(self) -> bool {
        matches!(self, Self::PinError | Self::UnpinError)
    }

    /// Queued or running; the status will change without further requests.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::PinQueued | Self::Pinning | Self::UnpinQueued | Self::Unpinning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpinned => "unpinned",
            Self::PinQueued => "pin_queued",
            Self::Pinning => "pinning",
            Self::Pinned => "pinned",
            Self::PinError => "pin_error",
            Self::UnpinQueued => "unpin_queued",
            Self::Unpinning => "unpinning",
            Self::UnpinError => "unpin_error",
        }
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of what this node knows about a CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinInfo {
    pub cid: Cid,
    pub status: TrackerStatus,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

impl PinInfo {
    pub fn unpinned(cid: Cid) -> Self {
        Self {
            cid,
            status: TrackerStatus::Unpinned,
            error: None,
            ts: Utc::now(),
        }
    }
}

/// Pin type as reported by the IPFS daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePinStatus {
    Direct,
    Recursive,
    Indirect,
    Unpinned,
}

impl RemotePinStatus {
    pub fn is_pinned(self) -> bool {
        !matches!(self, Self::Unpinned)
    }

    /// Parses the `Type` field of a `pin/ls` entry. Indirect pins come back as
    /// `indirect through <cid>` on some daemon versions.
    pub fn from_ipfs_type(t: &str) -> Self {
        match t {
            "direct" => Self::Direct,
            "recursive" => Self::Recursive,
            t if t.starts_with("indirect") => Self::Indirect,
            _ => Self::Unpinned,
        }
    }
}
