//! Pod name generation.
//!
//! Names are derived from the requesting user and a nanosecond timestamp,
//! hashed with SHA-256 and truncated so the result always fits
//! [`MAX_POD_NAME_LENGTH`].

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Prefix carried by every generated pod name.
pub const POD_NAME_PREFIX: &str = "user-";

/// Upper bound on the length of a generated pod name, prefix included.
pub const MAX_POD_NAME_LENGTH: usize = 10;

/// Generates a pod name for `user_id` salted with the current time.
pub fn generate_pod_name(user_id: &str) -> String {
    generate_pod_name_at(user_id, now_nanos())
}

/// Generates a pod name for `user_id` salted with the given timestamp.
pub fn generate_pod_name_at(user_id: &str, timestamp_nanos: u128) -> String {
    let digest = Sha256::digest(format!("{}-{}", user_id, timestamp_nanos).as_bytes());
    let mut suffix = hex::encode(digest);
    suffix.truncate(MAX_POD_NAME_LENGTH.saturating_sub(POD_NAME_PREFIX.len()));
    format!("{}{}", POD_NAME_PREFIX, suffix)
}

/// Derives a replacement after `previous` collided with an existing pod.
///
/// The new name is salted from the previous name rather than the user id.
pub fn rename_after_collision(previous: &str) -> String {
    generate_pod_name(previous)
}

fn now_nanos() -> u128 {
    // A clock before the epoch still yields a usable, if constant, salt.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
