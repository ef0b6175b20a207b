//! Peer registry persistence
//!
//! Pubs live under `pub/{sha256(url)}` as JSON; the local node's own record is
//! `pub/self`.

use tracing::{debug, warn};

use super::db::EntityDb;
use crate::error::EntityError;
use crate::storage::{Key, WriteBatch};
use crate::sync::{now_secs, Head, Pub};

/// Key prefix of stored pubs
pub const PUB_PREFIX: &str = "pub";

/// Reserved id of the local node's pub record
pub const SELF_ID: &str = "self";

fn pub_key(id: &str) -> Key {
    Key::new(&[PUB_PREFIX, id])
}

impl EntityDb {
    /// Every known peer except the local node.
    ///
    /// Pubs never fetched from (`last_updated == 0`) are reported as updated
    /// now so they sort as fresh. Unparseable records are skipped.
    pub fn get_pubs(&self) -> Result<Vec<Pub>, EntityError> {
        let self_key = pub_key(SELF_ID);
        let now = now_secs();
        let mut pubs = Vec::new();
        for (key, value) in self.store().prefix(Key::prefix(&[PUB_PREFIX]).as_bytes())? {
            if key == self_key.as_bytes() {
                continue;
            }
            match serde_json::from_slice::<Pub>(&value) {
                Ok(mut p) => {
                    if p.last_updated == 0 {
                        p.last_updated = now;
                    }
                    pubs.push(p);
                }
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), error = %e, "Skipping bad pub record")
                }
            }
        }
        Ok(pubs)
    }

    pub fn put_pub(&self, p: &Pub) -> Result<(), EntityError> {
        self.store()
            .set(pub_key(&p.url_hash()).as_bytes(), &serde_json::to_vec(p)?)?;
        Ok(())
    }

    pub fn get_pub(&self, url: &str) -> Result<Option<Pub>, EntityError> {
        let key = pub_key(&Pub::new(url).url_hash());
        match self.store().get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Register `url` if unknown and make it due for the next round.
    ///
    /// A round already in flight does not clear the mark when it records its
    /// results.
    pub fn mark_due(&self, url: &str) -> Result<Pub, EntityError> {
        let mut marks = self.lock_due_marks()?;
        let mut p = self.get_pub(url)?.unwrap_or_else(|| Pub::new(url));
        p.last_checked = 0;
        self.put_pub(&p)?;
        marks.insert(p.url.clone());
        debug!(url, "Pub marked due");
        Ok(p)
    }

    /// Known pubs at the start of a sync round.
    pub fn pubs_for_round(&self) -> Result<Vec<Pub>, EntityError> {
        let mut marks = self.lock_due_marks()?;
        marks.clear();
        self.get_pubs()
    }

    /// Persist the pubs a round checked and the ones it discovered.
    ///
    /// Pubs marked due while the round ran keep `last_checked = 0`.
    pub fn record_round(&self, checked: &[Pub], discovered: &[Pub]) -> Result<(), EntityError> {
        let mut marks = self.lock_due_marks()?;
        let mut batch = WriteBatch::new();
        for p in checked.iter().chain(discovered) {
            if marks.contains(&p.url) {
                let mut p = p.clone();
                p.last_checked = 0;
                batch.set(pub_key(&p.url_hash()), serde_json::to_vec(&p)?);
            } else {
                batch.set(pub_key(&p.url_hash()), serde_json::to_vec(p)?);
            }
        }
        self.store().write(batch)?;
        marks.clear();
        Ok(())
    }

    pub fn put_self(&self, p: &Pub) -> Result<(), EntityError> {
        self.store()
            .set(pub_key(SELF_ID).as_bytes(), &serde_json::to_vec(p)?)?;
        Ok(())
    }

    pub fn get_self(&self) -> Result<Option<Pub>, EntityError> {
        match self.store().get(pub_key(SELF_ID).as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Head of every stored feed
    pub fn heads(&self) -> Result<Vec<Head>, EntityError> {
        let mut heads = Vec::new();
        for signed in self.get_feeds()? {
            heads.push(Head {
                feed_id: signed.fingerprint()?,
                length: signed.length()?,
            });
        }
        Ok(heads)
    }
}
