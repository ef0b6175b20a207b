//! Gossip synchronization between pubs
//!
//! - `protocol` - one pull round over due peers and the announce push
//! - `client` - the peer wire surface as seen from the calling side
//! - `announcer` - bounded queue + worker draining outbound announcements
//! - `coordinator` - timer-driven loop that runs rounds and persists results

pub mod announcer;
pub mod client;
pub mod coordinator;
pub mod protocol;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use announcer::{AnnounceQueue, AnnounceTask, Announcer};
pub use client::{HttpPeerClient, PeerClient};
pub use coordinator::{RoundReport, SyncCoordinator, SyncHandle};
pub use protocol::{announce, sync_round, SyncOutcome};

/// Path root of the peer wire surface
pub const PROTOCOL_ROOT: &str = "sync";
pub const PUBS_PATH: &str = "pubs";
pub const HEADS_PATH: &str = "heads";
pub const FEED_PATH: &str = "feed";
pub const ANNOUNCE_PATH: &str = "announce";

/// Seconds since the Unix epoch
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pub {
    pub url: String,
    /// Last time a feed was fetched from this pub (unix seconds)
    #[serde(default)]
    pub last_updated: i64,
    /// Last time this pub was checked (unix seconds)
    #[serde(default)]
    pub last_checked: i64,
    /// Consecutive failed checks
    #[serde(default)]
    pub failures: u32,
}

impl Pub {
    /// A never-checked pub, due immediately.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_updated: 0,
            last_checked: 0,
            failures: 0,
        }
    }

    /// Hex SHA-256 of the URL, used as the registry key.
    pub fn url_hash(&self) -> String {
        hex::encode(Sha256::digest(self.url.as_bytes()))
    }

    /// `{url}/sync/{path}` with any trailing slash on the URL collapsed
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.url.trim_end_matches('/'), PROTOCOL_ROOT, path)
    }
}

/// A peer's claim about a feed's current length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub feed_id: String,
    pub length: usize,
}

/// Push notification that feeds advanced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub origin: Pub,
    pub heads: Vec<Head>,
}

/// Per-round lifecycle of a pub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubState {
    Idle,
    Due,
    Checking,
    Updated,
    Failed,
}

/// When a pub becomes due again.
///
/// A pub is due once `check_interval * 2^failures` has elapsed since its last
/// check, never waiting longer than `max_backoff`.
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    pub check_interval: Duration,
    pub max_backoff: Duration,
}

/// Failure count beyond which the backoff stops doubling
const MAX_BACKOFF_SHIFT: u32 = 16;

impl FreshnessPolicy {
    pub fn new(check_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            check_interval,
            max_backoff,
        }
    }

    /// Minimum time between checks after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(MAX_BACKOFF_SHIFT);
        self.check_interval
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff.max(self.check_interval))
    }

    pub fn state(&self, pub_: &Pub, now: i64) -> PubState {
        let elapsed = now.saturating_sub(pub_.last_checked);
        if elapsed >= self.backoff(pub_.failures).as_secs() as i64 {
            PubState::Due
        } else {
            PubState::Idle
        }
    }

    pub fn is_due(&self, pub_: &Pub, now: i64) -> bool {
        self.state(pub_, now) == PubState::Due
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_hash_is_stable_hex() {
        let a = Pub::new("http://a:8080");
        assert_eq!(a.url_hash().len(), 64);
        assert_eq!(a.url_hash(), Pub::new("http://a:8080").url_hash());
        assert_ne!(a.url_hash(), Pub::new("http://b:8080").url_hash());
    }

    #[test]
    fn test_endpoint_joins_paths() {
        assert_eq!(Pub::new("http://a/").endpoint(HEADS_PATH), "http://a/sync/heads");
        assert_eq!(Pub::new("http://a").endpoint("feed/fp"), "http://a/sync/feed/fp");
    }

    #[test]
    fn test_new_pub_is_due() {
        let policy = FreshnessPolicy::default();
        assert!(policy.is_due(&Pub::new("http://a"), 1_000));
    }

    #[test]
    fn test_recently_checked_pub_is_idle() {
        let policy = FreshnessPolicy::default();
        let mut p = Pub::new("http://a");
        p.last_checked = 1_000;
        assert_eq!(policy.state(&p, 1_005), PubState::Idle);
        assert_eq!(policy.state(&p, 1_010), PubState::Due);
    }

    #[test]
    fn test_failures_widen_backoff_up_to_cap() {
        let policy = FreshnessPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(0), Duration::from_secs(10));
        assert_eq!(policy.backoff(1), Duration::from_secs(20));
        assert_eq!(policy.backoff(2), Duration::from_secs(40));
        assert_eq!(policy.backoff(3), Duration::from_secs(60));
        assert_eq!(policy.backoff(100), Duration::from_secs(60));

        let mut p = Pub::new("http://a");
        p.last_checked = 1_000;
        p.failures = 2;
        assert!(!policy.is_due(&p, 1_030));
        assert!(policy.is_due(&p, 1_040));
    }

    #[test]
    fn test_pub_json_defaults() {
        let p: Pub = serde_json::from_str(r#"{"url":"http://a"}"#).unwrap();
        assert_eq!(p, Pub::new("http://a"));
    }
}
