// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Primary-store lifecycle events.
//!
//! The core only defines the payload and the idempotent-handler contract;
//! delivery (queue, webhook, polling) is up to the host. Events arrive
//! at-least-once, possibly duplicated and out of order.
//!
//! # Wire Format
//!
//! ```json
//! { "eventType": "CREATED", "objectID": "photos/cat.jpg", "copyID": "3HL4kqtJlcpXroDTDmJ" }
//! ```
//!
//! S3-style bucket notifications (`{"Records": [...]}`) can be decoded with
//! [`ObjectEvent::from_s3_notification`].

use crate::error::{BackupError, Result};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// Lifecycle transition reported by the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Created,
    Removed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "CREATED"),
            EventType::Removed => write!(f, "REMOVED"),
        }
    }
}

/// A single object lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "objectID")]
    pub object_id: String,
    /// Version token. Required for `CREATED`; a `REMOVED` without one
    /// disowns every live copy of the object.
    #[serde(rename = "copyID", default, skip_serializing_if = "Option::is_none")]
    pub copy_id: Option<String>,
}

impl ObjectEvent {
    pub fn created(object_id: impl Into<String>, copy_id: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Created,
            object_id: object_id.into(),
            copy_id: Some(copy_id.into()),
        }
    }

    pub fn removed(object_id: impl Into<String>, copy_id: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Removed,
            object_id: object_id.into(),
            copy_id: Some(copy_id.into()),
        }
    }

    /// Removal of every version of an object.
    pub fn removed_all(object_id: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Removed,
            object_id: object_id.into(),
            copy_id: None,
        }
    }

    /// Decode a JSON event payload.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| BackupError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.object_id.is_empty() {
            return Err(BackupError::InvalidEvent("empty objectID".to_string()));
        }
        match (&self.event_type, self.copy_id.as_deref()) {
            (EventType::Created, None) | (EventType::Created, Some("")) => Err(
                BackupError::InvalidEvent(format!("CREATED event for {} has no copyID", self.object_id)),
            ),
            (EventType::Removed, Some("")) => Err(BackupError::InvalidEvent(format!(
                "REMOVED event for {} has an empty copyID",
                self.object_id
            ))),
            _ => Ok(()),
        }
    }

    /// Decode an S3-style bucket notification into events.
    ///
    /// - `ObjectCreated:*` records map to `CREATED`, `ObjectRemoved:*` to `REMOVED`;
    ///   other event names are skipped.
    /// - Object keys are URL-decoded (`+` is a space).
    /// - The copy id is the `versionId` when present. Unversioned creations
    ///   fall back to the `sequencer`, which is stable across redeliveries of
    ///   the same notification. Unversioned removals disown every copy.
    pub fn from_s3_notification(payload: &[u8]) -> Result<Vec<Self>> {
        let notification: S3Notification = serde_json::from_slice(payload)
            .map_err(|e| BackupError::InvalidEvent(format!("not an S3 notification: {}", e)))?;

        let mut events = Vec::with_capacity(notification.records.len());
        for record in notification.records {
            let event_type = if record.event_name.contains("ObjectCreated") {
                EventType::Created
            } else if record.event_name.contains("ObjectRemoved") {
                EventType::Removed
            } else {
                tracing::debug!(event_name = %record.event_name, "Skipping unsupported notification record");
                continue;
            };

            let object = record.s3.object;
            let object_id = decode_object_key(&object.key);
            let copy_id = match event_type {
                EventType::Created => object.version_id.or(object.sequencer),
                EventType::Removed => object.version_id,
            };

            let event = Self {
                event_type,
                object_id,
                copy_id,
            };
            event.validate()?;
            events.push(event);
        }

        Ok(events)
    }
}

/// URL-decode an object key from a notification (`+` means space).
///
/// Only percent escapes are decoded; `&` and `=` are part of the key.
fn decode_object_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " ")).decode_utf8_lossy().into_owned()
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    #[serde(rename = "versionId", default)]
    version_id: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}
