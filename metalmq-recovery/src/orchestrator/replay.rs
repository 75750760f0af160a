//! Replaying the ledger snapshot over the live channels.
//!
//! Tiers are replayed one after the other. Within a tier the entries are grouped by channel, a
//! group is replayed sequentially and at most `concurrency` groups run at the same time.
use crate::{
    channel::LiveChannels,
    error::Outcome,
    ledger::{LedgerEntry, Snapshot},
    model::ChannelNumber,
    topology::{Entity, Identity, REPLAY_ORDER},
    transport::BrokerResult,
};
use futures::stream::{self, StreamExt};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};

/// What happened during a replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of entries declared again.
    pub replayed: usize,
    /// Entries the server answered with "not found", they were skipped.
    pub absent: Vec<Identity>,
    /// Server-named queues, they are not replayed and neither are their bindings and consumers.
    pub excluded: Vec<String>,
}

impl ReplayReport {
    fn merge(&mut self, other: ReplayReport) {
        self.replayed += other.replayed;
        self.absent.extend(other.absent);
    }
}

pub(crate) async fn replay(
    snapshot: &Snapshot,
    live: &mut LiveChannels,
    concurrency: usize,
) -> BrokerResult<ReplayReport> {
    let excluded = server_named_queues(snapshot);
    let mut report = ReplayReport {
        excluded: excluded.iter().cloned().collect(),
        ..Default::default()
    };

    for name in &excluded {
        warn!("Server-named queue '{name}' is not recovered together with its bindings and consumers");
    }

    for tier in REPLAY_ORDER {
        let entries = snapshot
            .tier(tier)
            .filter(|e| !is_excluded(e, &excluded))
            .collect::<Vec<_>>();

        if entries.is_empty() {
            continue;
        }

        trace!("Replaying {} entries of {tier:?}", entries.len());

        if entries.iter().any(|e| !live.contains(e.channel)) {
            live.open_fallback().await?;
        }

        let mut groups: BTreeMap<ChannelNumber, Vec<LedgerEntry>> = BTreeMap::new();

        for entry in entries {
            groups.entry(live.route(entry.channel)).or_default().push(entry.clone());
        }

        let channels: &LiveChannels = &*live;
        let replays = groups
            .into_iter()
            .map(|(channel, entries)| replay_group(channels, channel, entries))
            .collect::<Vec<_>>();
        let results = stream::iter(replays)
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        for result in results {
            report.merge(result?);
        }
    }

    live.close_fallback().await;

    debug!(
        "Replayed {} entries, {} were not found",
        report.replayed,
        report.absent.len()
    );

    Ok(report)
}

async fn replay_group(
    live: &LiveChannels,
    channel: ChannelNumber,
    entries: Vec<LedgerEntry>,
) -> BrokerResult<ReplayReport> {
    let mut report = ReplayReport::default();
    // consumers registered on the channel so far, a channel close cancels them
    let mut consumers: Vec<&LedgerEntry> = vec![];

    for entry in &entries {
        let identity = entry.identity();

        trace!("Replaying {identity} on channel {channel}");

        match Outcome::from(live.call(channel, entry.entity.replay_command()).await) {
            Outcome::Ok(_) => {
                report.replayed += 1;

                if let Entity::Consumer(_) = entry.entity {
                    consumers.push(entry);
                }
            }
            Outcome::ExpectedAbsence(e) => {
                warn!("Cannot recover {identity}: {}", e.message);

                report.absent.push(identity);

                // the server closes the channel on a channel error
                live.reopen(channel).await?;

                for consumer in &consumers {
                    trace!("Registering {} again on channel {channel}", consumer.identity());

                    live.call(channel, consumer.entity.replay_command()).await?;
                }
            }
            Outcome::RetryableFault(e) | Outcome::FatalFault(e) => {
                warn!("Recovering {identity} failed: {e}");

                return Err(e);
            }
        }
    }

    Ok(report)
}

fn server_named_queues(snapshot: &Snapshot) -> BTreeSet<String> {
    snapshot
        .iter()
        .filter_map(|e| match &e.entity {
            Entity::Queue(q) if q.server_named => Some(q.name.clone()),
            _ => None,
        })
        .collect()
}

fn is_excluded(entry: &LedgerEntry, excluded: &BTreeSet<String>) -> bool {
    match &entry.entity {
        Entity::Queue(q) => excluded.contains(&q.name),
        other => other.required_queue().is_some_and(|q| excluded.contains(q)),
    }
}
