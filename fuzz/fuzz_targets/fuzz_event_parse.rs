//! Fuzz target for event decoding.
//!
//! Arbitrary payloads must never panic either decoder, and anything that
//! decodes must pass validation and survive a JSON round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use object_backup::event::{EventType, ObjectEvent};

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = ObjectEvent::from_json(data) {
        assert!(event.validate().is_ok());
        assert!(!event.object_id.is_empty());
        if event.event_type == EventType::Created {
            assert!(event.copy_id.is_some());
        }

        let encoded = serde_json::to_vec(&event).unwrap();
        let decoded = ObjectEvent::from_json(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    if let Ok(events) = ObjectEvent::from_s3_notification(data) {
        for event in events {
            assert!(event.validate().is_ok());
        }
    }
});
