//! Uniqueness fingerprints and state bitmaps.
//!
//! A unique insert carries two values in its `meta`: `uniq_key`, a hash of
//! the canonically-serialized fields the spec selects, and `uniq_bmp`, a
//! bitmap of the states in which an existing row blocks a new one. The
//! database exposes `uniq_key` through a stored-generated column only while
//! the row's state is inside the bitmap, and a partial unique index enforces
//! at-most-one live candidate per fingerprint. Enforcement therefore lapses
//! on terminal rows without any delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::job::{JobSpec, JobState};

/// Meta key holding the fingerprint hash.
pub const META_KEY: &str = "uniq_key";
/// Meta key holding the state bitmap.
pub const META_BITMAP: &str = "uniq_bmp";

/// Job fields that can participate in a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueField {
    Worker,
    Queue,
    Args,
    Meta,
}

/// Declares how duplicate inserts of a job are collapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueSpec {
    /// Fields hashed into the fingerprint.
    pub fields: Vec<UniqueField>,
    /// When non-empty, only these top-level keys of `args`/`meta` participate.
    pub keys: Vec<String>,
    /// Seconds per dedup bucket; `None` means duplicates are blocked for as
    /// long as a row remains inside the state group.
    pub period: Option<i64>,
    /// States in which an existing row blocks a new insert.
    pub states: Vec<JobState>,
}

impl Default for UniqueSpec {
    fn default() -> Self {
        Self {
            fields: vec![UniqueField::Worker, UniqueField::Queue, UniqueField::Args],
            keys: Vec::new(),
            period: Some(60),
            states: vec![
                JobState::Scheduled,
                JobState::Available,
                JobState::Executing,
                JobState::Retryable,
                JobState::Completed,
            ],
        }
    }
}

impl UniqueSpec {
    /// Spec used for cron materialization: one insert per worker per period
    /// bucket, blocked by rows in any state so a completed run within the
    /// same minute still suppresses a duplicate tick.
    pub(crate) fn for_cron() -> Self {
        Self {
            fields: vec![UniqueField::Worker],
            keys: Vec::new(),
            period: Some(60),
            states: vec![
                JobState::Scheduled,
                JobState::Available,
                JobState::Executing,
                JobState::Retryable,
                JobState::Completed,
                JobState::Discarded,
                JobState::Cancelled,
            ],
        }
    }

    /// Encode the state group as a bitmap. States without a bit (`suspended`)
    /// are skipped.
    pub fn bitmap(&self) -> i32 {
        state_bitmap(&self.states)
    }

    /// Compute the fingerprint for a spec being inserted at `now`.
    ///
    /// Selected fields are serialized with stable key ordering and no
    /// whitespace, then hashed. When `period` is set the bucket index is part
    /// of the hashed material, so collisions expire as buckets roll over.
    pub fn fingerprint(&self, spec: &JobSpec, queue: &str, now: DateTime<Utc>) -> String {
        let mut material = Map::new();
        for field in &self.fields {
            match field {
                UniqueField::Worker => {
                    material.insert("worker".into(), json!(spec.worker));
                }
                UniqueField::Queue => {
                    material.insert("queue".into(), json!(queue));
                }
                UniqueField::Args => {
                    material.insert("args".into(), filter_keys(&spec.args, &self.keys));
                }
                UniqueField::Meta => {
                    material.insert("meta".into(), filter_keys(&spec.meta, &self.keys));
                }
            }
        }
        if let Some(period) = self.period.filter(|p| *p > 0) {
            material.insert("bucket".into(), json!(now.timestamp().div_euclid(period)));
        }

        // serde_json maps are BTree-ordered (the preserve_order feature is
        // off), so Value serialization is already canonical.
        let canonical = Value::Object(material).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..16])
    }
}

/// Encode a state group as a bitmap over the seven non-suspended states.
pub fn state_bitmap(states: &[JobState]) -> i32 {
    states
        .iter()
        .filter_map(|s| s.bit())
        .fold(0, |bmp, bit| bmp | (1 << bit))
}

/// Decode a bitmap back into its state group.
pub fn bitmap_states(bmp: i32) -> Vec<JobState> {
    [
        JobState::Scheduled,
        JobState::Available,
        JobState::Executing,
        JobState::Retryable,
        JobState::Completed,
        JobState::Discarded,
        JobState::Cancelled,
    ]
    .into_iter()
    .filter(|s| s.bit().map(|bit| bmp & (1 << bit) != 0).unwrap_or(false))
    .collect()
}

/// Stamp the fingerprint and bitmap into a job's `meta`.
pub(crate) fn apply_to_meta(meta: &mut Value, key: String, bmp: i32) {
    if !meta.is_object() {
        *meta = json!({});
    }
    if let Some(object) = meta.as_object_mut() {
        object.insert(META_KEY.into(), json!(key));
        object.insert(META_BITMAP.into(), json!(bmp));
    }
}

/// Restrict an object to the given top-level keys; an empty filter keeps all.
fn filter_keys(value: &Value, keys: &[String]) -> Value {
    if keys.is_empty() {
        return value.clone();
    }
    match value.as_object() {
        Some(object) => Value::Object(
            object
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec_with_args(args: Value) -> JobSpec {
        JobSpec::builder().worker("mailer.deliver").args(args).build()
    }

    #[test]
    fn fingerprint_ignores_args_key_order() {
        let unique = UniqueSpec::default();
        let now = Utc::now();
        let a = spec_with_args(json!({"to": "a@b.c", "template": "welcome"}));
        let b = spec_with_args(json!({"template": "welcome", "to": "a@b.c"}));
        assert_eq!(
            unique.fingerprint(&a, "default", now),
            unique.fingerprint(&b, "default", now)
        );
    }

    #[test]
    fn fingerprint_distinguishes_args() {
        let unique = UniqueSpec::default();
        let now = Utc::now();
        let a = spec_with_args(json!({"id": 1}));
        let b = spec_with_args(json!({"id": 2}));
        assert_ne!(
            unique.fingerprint(&a, "default", now),
            unique.fingerprint(&b, "default", now)
        );
    }

    #[test]
    fn key_filter_narrows_the_material() {
        let unique = UniqueSpec {
            keys: vec!["id".to_string()],
            ..UniqueSpec::default()
        };
        let now = Utc::now();
        let a = spec_with_args(json!({"id": 1, "note": "first"}));
        let b = spec_with_args(json!({"id": 1, "note": "second"}));
        assert_eq!(
            unique.fingerprint(&a, "default", now),
            unique.fingerprint(&b, "default", now)
        );
    }

    #[test]
    fn period_buckets_roll_over() {
        let unique = UniqueSpec {
            period: Some(60),
            ..UniqueSpec::default()
        };
        let spec = spec_with_args(json!({"id": 1}));
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap();
        let same_bucket = t0 + chrono::Duration::seconds(30);
        let next_bucket = t0 + chrono::Duration::seconds(60);
        assert_eq!(
            unique.fingerprint(&spec, "default", t0),
            unique.fingerprint(&spec, "default", same_bucket)
        );
        assert_ne!(
            unique.fingerprint(&spec, "default", t0),
            unique.fingerprint(&spec, "default", next_bucket)
        );
    }

    #[test]
    fn unbounded_period_is_time_independent() {
        let unique = UniqueSpec {
            period: None,
            ..UniqueSpec::default()
        };
        let spec = spec_with_args(json!({"id": 1}));
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            unique.fingerprint(&spec, "default", t0),
            unique.fingerprint(&spec, "default", t1)
        );
    }

    #[test]
    fn bitmap_round_trips() {
        let states = vec![JobState::Scheduled, JobState::Available, JobState::Completed];
        let bmp = state_bitmap(&states);
        assert_eq!(bmp, 0b0010011);
        assert_eq!(bitmap_states(bmp), states);
    }

    #[test]
    fn default_group_excludes_terminal_failures_and_suspended() {
        let unique = UniqueSpec::default();
        let bmp = unique.bitmap();
        assert_eq!(bmp & (1 << 5), 0, "discarded must not block");
        assert_eq!(bmp & (1 << 6), 0, "cancelled must not block");
        assert!(!unique.states.contains(&JobState::Suspended));
    }

    #[test]
    fn suspended_contributes_nothing_to_bitmaps() {
        assert_eq!(state_bitmap(&[JobState::Suspended]), 0);
    }

    #[test]
    fn apply_to_meta_stamps_both_values() {
        let mut meta = json!({"trace": "abc"});
        apply_to_meta(&mut meta, "deadbeef".to_string(), 31);
        assert_eq!(meta[META_KEY], json!("deadbeef"));
        assert_eq!(meta[META_BITMAP], json!(31));
        assert_eq!(meta["trace"], json!("abc"));
    }
}
