//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with expiry and
//! refresh-ahead metadata.

use std::time::{Duration, Instant};

// == Deadline ==
/// Returns `now + after`, clamped to the latest instant the platform can
/// represent instead of overflowing.
pub(crate) fn deadline(now: Instant, after: Duration) -> Instant {
    if let Some(at) = now.checked_add(after) {
        return at;
    }
    // Binary search for the furthest representable offset
    let (mut low, mut high) = (Duration::ZERO, after);
    while high - low > Duration::from_millis(1) {
        let mid = low + (high - low) / 2;
        if now.checked_add(mid).is_some() {
            low = mid;
        } else {
            high = mid;
        }
    }
    now + low
}

// == Cache Entry ==
/// A single cached value plus its temporal metadata.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    /// Primary key, unique within its shard
    pub key: String,
    /// The stored value; `None` marks a missing record
    pub value: Option<T>,
    /// Instant after which the entry is void
    pub expires_at: Instant,
    /// Instant after which the entry is due for a refresh. `None` when
    /// refresh-ahead is disabled.
    pub refresh_at: Option<Instant>,
    /// Refreshes signalled since the entry was last written
    pub num_of_refresh_retries: u32,
}

impl<T> Entry<T> {
    // == Constructor ==
    /// Creates an entry that expires at `expires_at`.
    ///
    /// # Arguments
    /// * `key` - The primary key
    /// * `value` - The value, or `None` for a missing record
    /// * `expires_at` - Absolute expiry instant
    /// * `refresh_at` - Absolute refresh instant, if refresh-ahead is enabled
    pub fn new(
        key: String,
        value: Option<T>,
        expires_at: Instant,
        refresh_at: Option<Instant>,
    ) -> Self {
        Self {
            key,
            value,
            expires_at,
            refresh_at,
            num_of_refresh_retries: 0,
        }
    }

    // == Is Expired ==
    /// An entry is expired once `now` is strictly past `expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    // == Is Due For Refresh ==
    /// Returns true when refresh-ahead is enabled for this entry and `now`
    /// is strictly past `refresh_at`.
    pub fn is_due_for_refresh(&self, now: Instant) -> bool {
        self.refresh_at.is_some_and(|at| now > at)
    }

    /// Returns true if this entry caches a confirmed absence.
    pub fn is_missing_record(&self) -> bool {
        self.value.is_none()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let now = Instant::now();
        let entry = Entry::new("k".to_string(), Some(7), now + Duration::from_secs(1), None);

        assert_eq!(entry.value, Some(7));
        assert_eq!(entry.num_of_refresh_retries, 0);
        assert!(!entry.is_missing_record());
        assert!(!entry.is_expired(now));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = Instant::now();
        let entry = Entry::new("k".to_string(), Some(1), now, None);

        // Exactly at expires_at is still valid
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_nanos(1)));
    }

    #[test]
    fn test_refresh_requires_refresh_at() {
        let now = Instant::now();
        let entry = Entry::new("k".to_string(), Some(1), now + Duration::from_secs(10), None);
        assert!(!entry.is_due_for_refresh(now + Duration::from_secs(5)));

        let entry = Entry::new(
            "k".to_string(),
            Some(1),
            now + Duration::from_secs(10),
            Some(now + Duration::from_secs(2)),
        );
        assert!(!entry.is_due_for_refresh(now + Duration::from_secs(2)));
        assert!(entry.is_due_for_refresh(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_missing_record() {
        let entry: Entry<String> =
            Entry::new("gone".to_string(), None, Instant::now(), None);
        assert!(entry.is_missing_record());
    }

    #[test]
    fn test_deadline_saturates_instead_of_overflowing() {
        let now = Instant::now();
        assert_eq!(deadline(now, Duration::from_secs(5)), now + Duration::from_secs(5));

        let far = deadline(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(60 * 60 * 24 * 365));
        assert!(far.checked_add(Duration::from_secs(1)).is_none());
    }
}
