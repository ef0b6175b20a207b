//! Calling side of the peer wire surface
//!
//! | Path | Method | Body |
//! |------|--------|------|
//! | `/sync/pubs` | GET | `[Pub]` |
//! | `/sync/heads` | GET | `[Head]` |
//! | `/sync/feed/{fingerprint}` | GET | `SignedFeed` |
//! | `/sync/announce` | POST | `Announcement` |

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{Announcement, Head, Pub, ANNOUNCE_PATH, FEED_PATH, HEADS_PATH, PUBS_PATH};
use crate::error::SyncError;
use crate::feed::SignedFeed;

/// Remote operations a sync round needs from a peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn get_pubs(&self, peer: &Pub) -> Result<Vec<Pub>, SyncError>;

    async fn get_heads(&self, peer: &Pub) -> Result<Vec<Head>, SyncError>;

    async fn get_feed(&self, peer: &Pub, fingerprint: &str) -> Result<SignedFeed, SyncError>;

    async fn announce(&self, peer: &Pub, announcement: &Announcement) -> Result<(), SyncError>;
}

/// reqwest-backed client; every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, SyncError> {
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        if !response.status().is_success() {
            return Err(SyncError::BadStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        response.json().await.map_err(|e| SyncError::InvalidResponse {
            url,
            reason: e.to_string(),
        })
    }
}

fn request_error(url: &str, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(url.to_string())
    } else {
        SyncError::unreachable(url, e)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_pubs(&self, peer: &Pub) -> Result<Vec<Pub>, SyncError> {
        self.get_json(peer.endpoint(PUBS_PATH)).await
    }

    async fn get_heads(&self, peer: &Pub) -> Result<Vec<Head>, SyncError> {
        self.get_json(peer.endpoint(HEADS_PATH)).await
    }

    async fn get_feed(&self, peer: &Pub, fingerprint: &str) -> Result<SignedFeed, SyncError> {
        self.get_json(peer.endpoint(&format!("{}/{}", FEED_PATH, fingerprint)))
            .await
    }

    async fn announce(&self, peer: &Pub, announcement: &Announcement) -> Result<(), SyncError> {
        let url = peer.endpoint(ANNOUNCE_PATH);
        let response = self
            .client
            .post(&url)
            .json(announcement)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        if !response.status().is_success() {
            return Err(SyncError::BadStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
