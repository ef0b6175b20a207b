//! Pull rounds and announcements
//!
//! A round walks every due pub, collects the peers it knows about and the
//! heads it serves, then fetches each feed from whichever pub reported the
//! longest version. Feeds are single-writer and append-only, so a longer log
//! is always the newer one.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::{Announcement, FreshnessPolicy, Head, Pub, PubState};
use crate::error::SyncError;
use crate::feed::{Codec, SignedFeed};

/// Result of one [`sync_round`]
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Peers discovered this round, deduplicated by URL
    pub new_pubs: Vec<Pub>,
    /// Fetched feeds whose fingerprint matched the advertised id
    pub new_feeds: Vec<SignedFeed>,
    /// Final state of every pub the round looked at
    pub states: Vec<(String, PubState)>,
}

impl SyncOutcome {
    pub fn failed(&self) -> usize {
        self.states
            .iter()
            .filter(|(_, s)| *s == PubState::Failed)
            .count()
    }
}

/// A pub advertising a feed longer than the local copy
struct Source {
    length: usize,
    pub_index: usize,
}

/// Run one pull round.
///
/// `pubs` is updated in place (check times, failure counters, fetch times).
/// `known_feeds` are the local heads used as the baseline for longest-wins.
/// `self_url` keeps the node from discovering itself through its peers.
///
/// Each newer feed is fetched from the pub advertising the longest head. A
/// feed that fails to verify against `codec` or comes back shorter than
/// advertised is discarded and the next-longest source is tried.
pub async fn sync_round(
    client: &dyn PeerClient,
    codec: &Codec,
    pubs: &mut [Pub],
    known_feeds: &[Head],
    policy: &FreshnessPolicy,
    self_url: Option<&str>,
    now: i64,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    let mut seen_urls: HashSet<String> = pubs.iter().map(|p| p.url.clone()).collect();
    if let Some(url) = self_url {
        seen_urls.insert(url.to_string());
    }

    let baseline: HashMap<&str, usize> = known_feeds
        .iter()
        .map(|h| (h.feed_id.as_str(), h.length))
        .collect();
    let mut sources: HashMap<String, Vec<Source>> = HashMap::new();

    for (index, peer) in pubs.iter_mut().enumerate() {
        if policy.state(peer, now) != PubState::Due {
            continue;
        }
        debug!(url = %peer.url, failures = peer.failures, state = ?PubState::Checking, "Checking pub");
        peer.last_checked = now;

        let (peer_pubs, heads) = match check_pub(client, peer).await {
            Ok(found) => found,
            Err(e) => {
                peer.failures = peer.failures.saturating_add(1);
                warn!(url = %peer.url, failures = peer.failures, error = %e, "Pub check failed");
                outcome.states.push((peer.url.clone(), PubState::Failed));
                continue;
            }
        };
        peer.failures = 0;
        outcome.states.push((peer.url.clone(), PubState::Updated));

        for mut found in peer_pubs {
            if found.url.is_empty() || !seen_urls.insert(found.url.clone()) {
                continue;
            }
            debug!(url = %found.url, via = %peer.url, "Discovered pub");
            found.last_updated = now;
            found.last_checked = 0;
            found.failures = 0;
            outcome.new_pubs.push(found);
        }

        for head in heads {
            let known = baseline.get(head.feed_id.as_str()).copied();
            if known.map_or(true, |len| head.length > len) {
                debug!(feed = %head.feed_id, length = head.length, via = %peer.url, "Newer head");
                sources.entry(head.feed_id).or_default().push(Source {
                    length: head.length,
                    pub_index: index,
                });
            }
        }
    }

    for (fingerprint, mut candidates) in sources {
        // longest first; on a tie the pub checked first wins
        candidates.sort_by(|a, b| b.length.cmp(&a.length));
        for source in candidates {
            let peer = &mut pubs[source.pub_index];
            match fetch_verified(client, codec, peer, &fingerprint, source.length).await {
                Ok(signed) => {
                    info!(feed = %fingerprint, url = %peer.url, length = source.length, "Fetched feed");
                    peer.last_updated = now;
                    outcome.new_feeds.push(signed);
                    break;
                }
                Err(SyncError::FingerprintMismatch { expected, actual }) => {
                    warn!(url = %peer.url, %expected, %actual, "Fingerprint mismatch, discarding feed");
                }
                Err(e) => {
                    warn!(feed = %fingerprint, url = %peer.url, error = %e, "Feed fetch failed");
                }
            }
        }
    }

    outcome
}

async fn check_pub(
    client: &dyn PeerClient,
    peer: &Pub,
) -> Result<(Vec<Pub>, Vec<Head>), SyncError> {
    let pubs = client.get_pubs(peer).await?;
    let heads = client.get_heads(peer).await?;
    Ok((pubs, heads))
}

/// Fetch `fingerprint` from `peer` and check the served feed really is it:
/// same fingerprint, a valid signature, and at least `length` operations.
pub async fn fetch_verified(
    client: &dyn PeerClient,
    codec: &Codec,
    peer: &Pub,
    fingerprint: &str,
    length: usize,
) -> Result<SignedFeed, SyncError> {
    let signed = client.get_feed(peer, fingerprint).await?;
    let actual = signed.fingerprint()?;
    if actual != fingerprint {
        return Err(SyncError::FingerprintMismatch {
            expected: fingerprint.to_string(),
            actual,
        });
    }
    let feed = codec.decode(&signed)?;
    if feed.len() < length {
        return Err(SyncError::InvalidResponse {
            url: peer.url.clone(),
            reason: format!("feed has {} operations, head claimed {}", feed.len(), length),
        });
    }
    Ok(signed)
}

/// Push the head of `signed` to every pub in `pubs`, concurrently.
///
/// Best effort: failures are logged and otherwise dropped. Returns the number
/// of pubs that acknowledged.
pub async fn announce(
    client: &dyn PeerClient,
    origin: &Pub,
    pubs: &[Pub],
    signed: &SignedFeed,
) -> Result<usize, SyncError> {
    let head = Head {
        feed_id: signed.fingerprint()?,
        length: signed.length()?,
    };
    let announcement = Announcement {
        origin: origin.clone(),
        heads: vec![head],
    };

    let targets: Vec<&Pub> = pubs.iter().filter(|p| p.url != origin.url).collect();
    let results = join_all(targets.iter().map(|peer| client.announce(peer, &announcement))).await;

    let mut delivered = 0;
    for (peer, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => warn!(url = %peer.url, error = %e, "Announce failed"),
        }
    }
    debug!(delivered, total = targets.len(), "Announced head");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::entities::Datom;
    use crate::feed::{Codec, Feed, NodeKey, Operation};

    /// In-process peers keyed by URL
    #[derive(Default)]
    struct FakePeers {
        pubs: HashMap<String, Vec<Pub>>,
        heads: HashMap<String, Vec<Head>>,
        feeds: HashMap<(String, String), SignedFeed>,
        down: HashSet<String>,
        announced: Mutex<Vec<(String, Announcement)>>,
    }

    impl FakePeers {
        fn check(&self, peer: &Pub) -> Result<(), SyncError> {
            if self.down.contains(&peer.url) {
                Err(SyncError::unreachable(&peer.url, "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PeerClient for FakePeers {
        async fn get_pubs(&self, peer: &Pub) -> Result<Vec<Pub>, SyncError> {
            self.check(peer)?;
            Ok(self.pubs.get(&peer.url).cloned().unwrap_or_default())
        }

        async fn get_heads(&self, peer: &Pub) -> Result<Vec<Head>, SyncError> {
            self.check(peer)?;
            Ok(self.heads.get(&peer.url).cloned().unwrap_or_default())
        }

        async fn get_feed(&self, peer: &Pub, fingerprint: &str) -> Result<SignedFeed, SyncError> {
            self.check(peer)?;
            self.feeds
                .get(&(peer.url.clone(), fingerprint.to_string()))
                .cloned()
                .ok_or_else(|| SyncError::BadStatus {
                    url: peer.url.clone(),
                    status: 404,
                })
        }

        async fn announce(&self, peer: &Pub, announcement: &Announcement) -> Result<(), SyncError> {
            self.check(peer)?;
            self.announced
                .lock()
                .unwrap()
                .push((peer.url.clone(), announcement.clone()));
            Ok(())
        }
    }

    fn signed_feed(key: &NodeKey, ops: usize) -> SignedFeed {
        let mut feed = Feed::new(key);
        for i in 1..ops {
            feed.append(Operation::eav(vec![Datom::assert(
                "e1",
                "Bookmark/url",
                format!("http://{}", i).into(),
            )]));
        }
        Codec::with_defaults().encode(&feed, key).unwrap()
    }

    fn head(fp: &str, length: usize) -> Head {
        Head {
            feed_id: fp.to_string(),
            length,
        }
    }

    #[tokio::test]
    async fn test_longest_head_wins() {
        let key = NodeKey::generate();
        let fp = key.fingerprint();
        let mut peers = FakePeers::default();
        peers.heads.insert("http://a".into(), vec![head(&fp, 7)]);
        peers.heads.insert("http://b".into(), vec![head(&fp, 6)]);
        peers
            .feeds
            .insert(("http://a".into(), fp.clone()), signed_feed(&key, 7));
        peers
            .feeds
            .insert(("http://b".into(), fp.clone()), signed_feed(&key, 6));

        let mut pubs = vec![Pub::new("http://b"), Pub::new("http://a")];
        let outcome = sync_round(
            &peers,
            &Codec::with_defaults(),
            &mut pubs,
            &[head(&fp, 5)],
            &FreshnessPolicy::default(),
            None,
            1_000,
        )
        .await;

        assert_eq!(outcome.new_feeds.len(), 1);
        assert_eq!(outcome.new_feeds[0].length().unwrap(), 7);
        assert_eq!(pubs[1].last_updated, 1_000);
        assert_eq!(pubs[0].last_updated, 0);
    }

    #[tokio::test]
    async fn test_shorter_or_equal_heads_are_not_fetched() {
        let key = NodeKey::generate();
        let fp = key.fingerprint();
        let mut peers = FakePeers::default();
        peers.heads.insert("http://a".into(), vec![head(&fp, 3)]);

        let mut pubs = vec![Pub::new("http://a")];
        let outcome = sync_round(
            &peers,
            &Codec::with_defaults(),
            &mut pubs,
            &[head(&fp, 3)],
            &FreshnessPolicy::default(),
            None,
            1_000,
        )
        .await;
        assert!(outcome.new_feeds.is_empty());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_discarded() {
        let claimed = NodeKey::generate().fingerprint();
        let imposter = NodeKey::generate();
        let mut peers = FakePeers::default();
        peers.heads.insert("http://a".into(), vec![head(&claimed, 2)]);
        peers
            .feeds
            .insert(("http://a".into(), claimed.clone()), signed_feed(&imposter, 2));

        let mut pubs = vec![Pub::new("http://a")];
        let outcome = sync_round(&peers, &Codec::with_defaults(), &mut pubs, &[], &FreshnessPolicy::default(), None, 1_000).await;
        assert!(outcome.new_feeds.is_empty());
    }

    #[tokio::test]
    async fn test_overclaiming_source_falls_back_to_next() {
        let key = NodeKey::generate();
        let fp = key.fingerprint();
        let honest = signed_feed(&key, 5);
        let mut forged = signed_feed(&key, 6);
        forged.signature = signed_feed(&key, 2).signature;

        let mut peers = FakePeers::default();
        peers.heads.insert("http://short".into(), vec![head(&fp, 9)]);
        peers.heads.insert("http://forged".into(), vec![head(&fp, 8)]);
        peers.heads.insert("http://honest".into(), vec![head(&fp, 5)]);
        peers
            .feeds
            .insert(("http://short".into(), fp.clone()), signed_feed(&key, 3));
        peers.feeds.insert(("http://forged".into(), fp.clone()), forged);
        peers.feeds.insert(("http://honest".into(), fp.clone()), honest);

        let mut pubs = vec![
            Pub::new("http://honest"),
            Pub::new("http://short"),
            Pub::new("http://forged"),
        ];
        let outcome = sync_round(
            &peers,
            &Codec::with_defaults(),
            &mut pubs,
            &[head(&fp, 2)],
            &FreshnessPolicy::default(),
            None,
            1_000,
        )
        .await;

        assert_eq!(outcome.new_feeds.len(), 1);
        assert_eq!(outcome.new_feeds[0].length().unwrap(), 5);
        assert_eq!(pubs[0].last_updated, 1_000);
        assert_eq!(pubs[1].last_updated, 0);
        assert_eq!(pubs[2].last_updated, 0);
    }

    #[tokio::test]
    async fn test_failed_pub_does_not_abort_round() {
        let key = NodeKey::generate();
        let fp = key.fingerprint();
        let mut peers = FakePeers::default();
        peers.down.insert("http://down".into());
        peers.heads.insert("http://up".into(), vec![head(&fp, 1)]);
        peers
            .feeds
            .insert(("http://up".into(), fp.clone()), signed_feed(&key, 1));

        let mut down = Pub::new("http://down");
        down.failures = 2;
        down.last_checked = 0;
        let mut pubs = vec![down, Pub::new("http://up")];
        let outcome = sync_round(&peers, &Codec::with_defaults(), &mut pubs, &[], &FreshnessPolicy::default(), None, 1_000_000).await;

        assert_eq!(pubs[0].failures, 3);
        assert_eq!(pubs[0].last_checked, 1_000_000);
        assert_eq!(pubs[1].failures, 0);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.new_feeds.len(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let peers = FakePeers::default();
        let mut p = Pub::new("http://a");
        p.failures = 4;
        let mut pubs = vec![p];
        sync_round(&peers, &Codec::with_defaults(), &mut pubs, &[], &FreshnessPolicy::default(), None, 1_000_000).await;
        assert_eq!(pubs[0].failures, 0);
    }

    #[tokio::test]
    async fn test_idle_pubs_are_skipped() {
        let mut peers = FakePeers::default();
        peers.down.insert("http://a".into());
        let mut p = Pub::new("http://a");
        p.last_checked = 995;
        let mut pubs = vec![p];
        let outcome = sync_round(&peers, &Codec::with_defaults(), &mut pubs, &[], &FreshnessPolicy::default(), None, 1_000).await;
        assert!(outcome.states.is_empty());
        assert_eq!(pubs[0].failures, 0);
    }

    #[tokio::test]
    async fn test_discovered_pubs_are_deduplicated() {
        let mut peers = FakePeers::default();
        peers.pubs.insert(
            "http://a".into(),
            vec![Pub::new("http://c"), Pub::new("http://b"), Pub::new("http://me")],
        );
        peers
            .pubs
            .insert("http://b".into(), vec![Pub::new("http://c"), Pub::new("http://d")]);

        let mut pubs = vec![Pub::new("http://a"), Pub::new("http://b")];
        let outcome = sync_round(
            &peers,
            &Codec::with_defaults(),
            &mut pubs,
            &[],
            &FreshnessPolicy::default(),
            Some("http://me"),
            1_000,
        )
        .await;

        let urls: Vec<&str> = outcome.new_pubs.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["http://c", "http://d"]);
        assert!(outcome.new_pubs.iter().all(|p| p.last_updated == 1_000));
    }

    #[tokio::test]
    async fn test_announce_reaches_every_pub() {
        let key = NodeKey::generate();
        let mut peers = FakePeers::default();
        peers.down.insert("http://down".into());
        let signed = signed_feed(&key, 3);
        let origin = Pub::new("http://me");
        let pubs = vec![Pub::new("http://a"), Pub::new("http://down"), Pub::new("http://b")];

        let delivered = announce(&peers, &origin, &pubs, &signed).await.unwrap();
        assert_eq!(delivered, 2);

        let announced = peers.announced.lock().unwrap();
        assert_eq!(announced.len(), 2);
        assert_eq!(announced[0].1.origin.url, "http://me");
        assert_eq!(announced[0].1.heads, vec![head(&key.fingerprint(), 3)]);
    }
}
