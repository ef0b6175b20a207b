//! Sync coordinator - drives pull rounds on a timer
//!
//! Besides inbound announcements marking a pub due, the coordinator is the
//! only writer of pub freshness state. Rounds run inline in its loop, so a
//! slow round delays the next tick instead of overlapping it. A
//! [`SyncHandle`] can request an early round; dropping every handle stops the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::protocol::{sync_round, SyncOutcome};
use super::{now_secs, FreshnessPolicy, Pub};
use crate::entities::{EntityDb, IngestOutcome};
use crate::error::EntityError;

/// Requests early rounds from a running [`SyncCoordinator`]
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<()>,
}

impl SyncHandle {
    /// Ask for a round soon. Requests made while one is pending coalesce.
    pub fn nudge(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Summary of one coordinated round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub checked: usize,
    pub failed: usize,
    pub new_pubs: usize,
    pub feeds_updated: usize,
}

pub struct SyncCoordinator {
    db: Arc<EntityDb>,
    client: Arc<dyn PeerClient>,
    policy: FreshnessPolicy,
    interval: Duration,
    self_url: Option<String>,
    nudges: mpsc::Receiver<()>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<EntityDb>,
        client: Arc<dyn PeerClient>,
        policy: FreshnessPolicy,
        interval: Duration,
        self_url: Option<String>,
    ) -> (SyncHandle, Self) {
        let (tx, nudges) = mpsc::channel(1);
        let coordinator = Self {
            db,
            client,
            policy,
            interval,
            self_url,
            nudges,
        };
        (SyncHandle { tx }, coordinator)
    }

    /// Run rounds on every tick or nudge until all handles are dropped.
    pub async fn run(mut self) {
        let mut sync_timer = tokio::time::interval(self.interval);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "Sync coordinator started");

        loop {
            tokio::select! {
                _ = sync_timer.tick() => {}
                nudge = self.nudges.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                    debug!("Early sync requested");
                }
            }
            if let Err(e) = self.run_round().await {
                warn!(error = %e, "Sync round failed");
            }
        }
        info!("Sync coordinator stopped");
    }

    /// One round: check due pubs, persist what was learned, ingest feeds.
    pub async fn run_round(&self) -> Result<RoundReport, EntityError> {
        let mut pubs = self.db.pubs_for_round()?;
        let heads = self.db.heads()?;

        let outcome = sync_round(
            self.client.as_ref(),
            self.db.codec(),
            &mut pubs,
            &heads,
            &self.policy,
            self.self_url.as_deref(),
            now_secs(),
        )
        .await;

        let checked: Vec<Pub> = pubs
            .into_iter()
            .filter(|p| outcome.states.iter().any(|(url, _)| *url == p.url))
            .collect();
        self.db.record_round(&checked, &outcome.new_pubs)?;
        let feeds_updated = self.ingest(&outcome);

        let report = RoundReport {
            checked: outcome.states.len(),
            failed: outcome.failed(),
            new_pubs: outcome.new_pubs.len(),
            feeds_updated,
        };
        if report.checked > 0 {
            info!(
                checked = report.checked,
                failed = report.failed,
                new_pubs = report.new_pubs,
                feeds_updated = report.feeds_updated,
                "Sync round complete"
            );
        }
        Ok(report)
    }

    fn ingest(&self, outcome: &SyncOutcome) -> usize {
        let mut updated = 0;
        for signed in &outcome.new_feeds {
            match self.db.ingest_feed(signed) {
                Ok(IngestOutcome::Unchanged) => {}
                Ok(_) => updated += 1,
                Err(e) => warn!(error = %e, "Rejected fetched feed"),
            }
        }
        updated
    }
}
