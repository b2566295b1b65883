// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Copy records: one row per replicated object version.
//!
//! `(object_id, copy_id)` is the primary key. The disown flag is stored as a
//! tagged `0`/`1` value so that the disown index can be keyed by
//! `(disown_status, disown_timestamp)`.
//!
//! ```text
//! created ──► { disowned: false, disowned_at: None }
//!                    │ object removed
//!                    ▼
//!             { disowned: true,  disowned_at: Some(t) }   (never reverts)
//!                    │ t + retention elapsed
//!                    ▼
//!               blob deleted, then record deleted
//! ```

use object_store::path::Path;
use serde::{Deserialize, Serialize};

/// Disown flag as persisted (`0` = owned, `1` = disowned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DisownStatus {
    Owned = 0,
    Disowned = 1,
}

impl DisownStatus {
    pub fn as_flag(self) -> u8 {
        self as u8
    }

    pub fn is_disowned(self) -> bool {
        self == Self::Disowned
    }
}

impl From<DisownStatus> for u8 {
    fn from(status: DisownStatus) -> Self {
        status.as_flag()
    }
}

impl TryFrom<u8> for DisownStatus {
    type Error = String;

    fn try_from(flag: u8) -> Result<Self, Self::Error> {
        match flag {
            0 => Ok(Self::Owned),
            1 => Ok(Self::Disowned),
            other => Err(format!("invalid disown flag {other}")),
        }
    }
}

/// Tracking record for one replicated copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRecord {
    /// Key of the source object in the primary store.
    pub object_id: String,
    /// Version token distinguishing copies of the same object.
    pub copy_id: String,
    pub disown_status: DisownStatus,
    /// Epoch seconds; set exactly once, together with the false→true transition.
    pub disown_timestamp: Option<i64>,
    /// Location of the replicated blob in the secondary store.
    pub location: String,
    /// Epoch seconds when the blob was written.
    pub replicated_at: i64,
    /// Blob size in bytes.
    pub size: u64,
}

impl CopyRecord {
    /// Create an owned record for a freshly written blob.
    pub fn owned(
        object_id: impl Into<String>,
        copy_id: impl Into<String>,
        location: impl Into<String>,
        replicated_at: i64,
        size: u64,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            copy_id: copy_id.into(),
            disown_status: DisownStatus::Owned,
            disown_timestamp: None,
            location: location.into(),
            replicated_at,
            size,
        }
    }

    pub fn is_disowned(&self) -> bool {
        self.disown_status.is_disowned()
    }

    /// Return a disowned copy of this record, keeping an earlier timestamp.
    pub fn disowned_at(mut self, at: i64) -> Self {
        if !self.is_disowned() {
            self.disown_status = DisownStatus::Disowned;
            self.disown_timestamp = Some(at);
        }
        self
    }

    /// Derive the secondary-store location for a copy.
    ///
    /// `object_id` and `copy_id` each become exactly one path segment, with
    /// `/`, `%` and other reserved characters percent-encoded, so distinct
    /// keys never share a location. Both ids must be non-empty.
    pub fn location_for(prefix: Option<&str>, object_id: &str, copy_id: &str) -> String {
        prefix
            .map(Path::from)
            .unwrap_or_default()
            .child(object_id)
            .child(copy_id)
            .to_string()
    }

    /// Primary key as a tuple (for logging and index keys).
    pub fn key(&self) -> (&str, &str) {
        (&self.object_id, &self.copy_id)
    }
}

/// Result of a conditional disown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisownOutcome {
    /// The record transitioned false → true at the given time.
    Disowned,
    /// The record was already disowned; its timestamp is unchanged.
    AlreadyDisowned,
    /// No record for the key (not yet created, or already cleaned).
    Absent,
}

impl DisownOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disowned => "disowned",
            Self::AlreadyDisowned => "already_disowned",
            Self::Absent => "absent",
        }
    }
}
