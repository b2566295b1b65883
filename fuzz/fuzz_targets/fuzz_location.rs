//! Fuzz target for secondary-store location derivation.
//!
//! Location derivation must never panic and must be deterministic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use object_backup::record::CopyRecord;
use object_store::path::PathPart;

fuzz_target!(|data: (Option<&str>, &str, &str)| {
    let (prefix, object_id, copy_id) = data;

    let first = CopyRecord::location_for(prefix, object_id, copy_id);
    let second = CopyRecord::location_for(prefix, object_id, copy_id);
    assert_eq!(first, second);

    if object_id.is_empty() || copy_id.is_empty() {
        return;
    }

    // Each id is exactly one encoded segment
    let mut segments = first.rsplit('/');
    assert_eq!(segments.next(), Some(PathPart::from(copy_id).as_ref()));
    assert_eq!(segments.next(), Some(PathPart::from(object_id).as_ref()));

    // Moving the split point between the ids changes the location
    let joined = format!("{object_id}/{copy_id}");
    if let Some((head, tail)) = joined.rsplit_once('/') {
        if head != object_id && !head.is_empty() && !tail.is_empty() {
            assert_ne!(first, CopyRecord::location_for(prefix, head, tail));
        }
    }
});
