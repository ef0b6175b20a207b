//! Outbound announcement queue
//!
//! Local writes enqueue an [`AnnounceTask`] and return immediately; a single
//! [`Announcer`] worker drains the queue and pushes heads to peers. When every
//! [`AnnounceQueue`] handle is dropped the worker finishes the queued tasks
//! and exits.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::protocol::announce;
use super::Pub;
use crate::feed::SignedFeed;

/// One feed update to push to a set of peers
#[derive(Debug, Clone)]
pub struct AnnounceTask {
    pub origin: Pub,
    pub pubs: Vec<Pub>,
    pub feed: SignedFeed,
}

/// Sending half held by the entity store
#[derive(Debug, Clone)]
pub struct AnnounceQueue {
    tx: mpsc::Sender<AnnounceTask>,
}

impl AnnounceQueue {
    /// Enqueue without waiting. A full or closed queue drops the task.
    pub fn enqueue(&self, task: AnnounceTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(pubs = task.pubs.len(), "Announce queue full, dropping announcement");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Announcer stopped, dropping announcement");
                false
            }
        }
    }
}

/// Worker draining the announce queue
pub struct Announcer {
    client: Arc<dyn PeerClient>,
    rx: mpsc::Receiver<AnnounceTask>,
}

impl Announcer {
    /// Create a worker and its queue, holding at most `capacity` pending tasks.
    pub fn channel(client: Arc<dyn PeerClient>, capacity: usize) -> (AnnounceQueue, Announcer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (AnnounceQueue { tx }, Announcer { client, rx })
    }

    /// Run until every queue handle is dropped and the backlog is drained.
    pub async fn run(mut self) {
        info!("Announcer started");
        while let Some(task) = self.rx.recv().await {
            if task.pubs.is_empty() {
                continue;
            }
            match announce(self.client.as_ref(), &task.origin, &task.pubs, &task.feed).await {
                Ok(delivered) => debug!(delivered, "Announcement sent"),
                Err(e) => warn!(error = %e, "Announcement skipped"),
            }
        }
        info!("Announcer stopped");
    }
}
