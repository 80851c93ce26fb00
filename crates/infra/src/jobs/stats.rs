//! Cross-topic statistics for dashboards and the periodic stats log line.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use lingoq_core::Topic;

use super::backend::QueueResult;
use super::manager::QueueManager;
use super::types::QueueStats;

/// Point-in-time stats of every known topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub topics: BTreeMap<String, QueueStats>,
    pub totals: QueueStats,
}

#[derive(Debug, Clone)]
pub struct StatsAggregator {
    manager: QueueManager,
    /// Always reported, even before their first job.
    pinned: Vec<Topic>,
}

impl StatsAggregator {
    pub fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            pinned: Vec::new(),
        }
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.pinned.extend(topics);
        self
    }

    pub async fn topic(&self, topic: &Topic) -> QueueResult<QueueStats> {
        self.manager.stats(topic).await
    }

    pub async fn snapshot(&self) -> QueueResult<StatsSnapshot> {
        let mut names: Vec<Topic> = self.manager.topics().await?;
        names.extend(self.pinned.iter().cloned());
        names.sort();
        names.dedup();

        let mut topics = BTreeMap::new();
        let mut totals = QueueStats::default();
        for topic in names {
            let stats = self.manager.stats(&topic).await?;
            totals.merge(&stats);
            topics.insert(topic.as_str().to_string(), stats);
        }

        Ok(StatsSnapshot {
            taken_at: Utc::now(),
            topics,
            totals,
        })
    }

    /// Log a snapshot every `every` until `stop` flips or its sender drops.
    pub fn spawn_reporter(&self, every: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => match aggregator.snapshot().await {
                        Ok(snapshot) => log_snapshot(&snapshot),
                        Err(err) => warn!(error = %err, "stats snapshot failed"),
                    }
                }
            }
        })
    }
}

fn log_snapshot(snapshot: &StatsSnapshot) {
    for (topic, s) in &snapshot.topics {
        info!(
            topic = %topic,
            pending = s.pending,
            processing = s.processing,
            completed = s.completed,
            failed = s.failed,
            cancelled = s.cancelled,
            avg_processing_time_seconds = s.avg_processing_time_seconds,
            "queue stats"
        );
    }
}
