//! The topology ledger is the record of what the application declared and did not delete.
//!
//! It is a pure data structure, every operation takes the lock once and releases it before
//! returning, so the lock is never held across a network call. Cascading removals happen under
//! the same lock acquisition, a snapshot never sees half of an application call.
use crate::{
    consumer::ConsumerSink,
    model::ChannelNumber,
    topology::{ConsumerSpec, Entity, Identity, Tier},
};
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An entity together with the channel it was declared on.
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub channel: ChannelNumber,
    pub entity: Entity,
}

impl LedgerEntry {
    pub fn identity(&self) -> Identity {
        self.entity.identity()
    }
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    /// Identity to the insertion sequence number of the entry.
    index: HashMap<Identity, u64>,
    ordered: BTreeMap<u64, LedgerEntry>,
}

impl Entries {
    fn remove(&mut self, identity: &Identity) -> Option<LedgerEntry> {
        let seq = self.index.remove(identity)?;

        self.ordered.remove(&seq)
    }

    fn remove_where<F>(&mut self, pred: F) -> Vec<LedgerEntry>
    where
        F: Fn(&LedgerEntry) -> bool,
    {
        let seqs = self
            .ordered
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(seq, _)| *seq)
            .collect::<Vec<_>>();

        let mut removed = vec![];

        for seq in seqs {
            if let Some(entry) = self.ordered.remove(&seq) {
                self.index.remove(&entry.identity());
                removed.push(entry);
            }
        }

        removed
    }

    fn any<F>(&self, pred: F) -> bool
    where
        F: Fn(&LedgerEntry) -> bool,
    {
        self.ordered.values().any(pred)
    }
}

/// Cheaply clonable handle of the ledger of one connection.
#[derive(Clone, Default)]
pub struct TopologyLedger {
    entries: Arc<Mutex<Entries>>,
}

impl TopologyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an entry or replace the one with the same identity. A replaced entry keeps its
    /// position in the replay order.
    pub fn record(&self, channel: ChannelNumber, entity: Entity) {
        let identity = entity.identity();
        let entry = LedgerEntry { channel, entity };
        let mut entries = self.lock();

        trace!("Record {identity} on channel {channel}");

        match entries.index.get(&identity).copied() {
            Some(seq) => {
                entries.ordered.insert(seq, entry);
            }
            None => {
                let seq = entries.next_seq;
                entries.next_seq += 1;
                entries.index.insert(identity, seq);
                entries.ordered.insert(seq, entry);
            }
        }
    }

    /// Remove exactly one identity. It is a no-op if the identity is not recorded.
    pub fn forget(&self, identity: &Identity) -> Option<LedgerEntry> {
        let removed = self.lock().remove(identity);

        if removed.is_some() {
            trace!("Forget {identity}");
        }

        removed
    }

    /// Remove an exchange or a queue together with the entries which cannot exist without it.
    ///
    /// For an exchange these are the bindings where it is the source or the destination, for a
    /// queue the bindings to the queue and the consumers of the queue. The removed entries are
    /// returned, the entity itself first.
    pub fn forget_with_dependents(&self, identity: &Identity) -> Vec<LedgerEntry> {
        let mut entries = self.lock();
        let mut removed = vec![];

        if let Some(entry) = entries.remove(identity) {
            removed.push(entry);
        }

        match identity {
            Identity::Exchange(name) => {
                removed.extend(entries.remove_where(|e| match &e.entity {
                    Entity::Binding(b) => b.touches_exchange(name),
                    _ => false,
                }));
            }
            Identity::Queue(name) => {
                removed.extend(entries.remove_where(|e| match &e.entity {
                    Entity::Binding(b) => b.binds_queue(name),
                    Entity::Consumer(c) => &c.queue == name,
                    _ => false,
                }));
            }
            _ => {}
        }

        trace!("Forget {identity} with {} entries", removed.len());

        removed
    }

    /// Remove the consumers which were registered on a channel. The channel is closed, the server
    /// cancelled them.
    pub fn forget_channel_consumers(&self, channel: ChannelNumber) -> Vec<ConsumerSpec> {
        self.lock()
            .remove_where(|e| e.channel == channel && matches!(e.entity, Entity::Consumer(_)))
            .into_iter()
            .filter_map(|e| match e.entity {
                Entity::Consumer(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// The server deletes an auto-delete queue when its last consumer goes away. If the queue is
    /// recorded as auto-delete and has no more recorded consumers, forget it with its bindings.
    pub fn forget_auto_deleted_queue(&self, queue: &str) -> Vec<LedgerEntry> {
        let mut entries = self.lock();
        let identity = Identity::Queue(queue.to_string());

        let auto_delete = match entries.index.get(&identity).and_then(|seq| entries.ordered.get(seq)) {
            Some(LedgerEntry {
                entity: Entity::Queue(q),
                ..
            }) => q.is_auto_delete(),
            _ => false,
        };

        if !auto_delete || entries.any(|e| matches!(&e.entity, Entity::Consumer(c) if c.queue == queue)) {
            return vec![];
        }

        let mut removed = vec![];

        if let Some(entry) = entries.remove(&identity) {
            removed.push(entry);
        }

        removed.extend(entries.remove_where(|e| matches!(&e.entity, Entity::Binding(b) if b.binds_queue(queue))));

        trace!("Forget auto-deleted queue '{queue}'");

        removed
    }

    /// The server deletes an auto-delete exchange when its last binding is removed. If the exchange
    /// is recorded as auto-delete and is not the source of any recorded binding, forget it.
    pub fn forget_auto_deleted_exchange(&self, exchange: &str) -> Vec<LedgerEntry> {
        let mut entries = self.lock();
        let identity = Identity::Exchange(exchange.to_string());

        let auto_delete = match entries.index.get(&identity).and_then(|seq| entries.ordered.get(seq)) {
            Some(LedgerEntry {
                entity: Entity::Exchange(x),
                ..
            }) => x.is_auto_delete(),
            _ => false,
        };

        if !auto_delete || entries.any(|e| matches!(&e.entity, Entity::Binding(b) if b.source == exchange)) {
            return vec![];
        }

        let mut removed = vec![];

        if let Some(entry) = entries.remove(&identity) {
            removed.push(entry);
        }

        removed.extend(entries.remove_where(|e| matches!(&e.entity, Entity::Binding(b) if b.touches_exchange(exchange))));

        trace!("Forget auto-deleted exchange '{exchange}'");

        removed
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.lock().index.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ordered.is_empty()
    }

    /// The sinks of all the recorded consumers.
    pub fn consumer_sinks(&self) -> Vec<ConsumerSink> {
        self.lock()
            .ordered
            .values()
            .filter_map(|e| match &e.entity {
                Entity::Consumer(c) => Some(c.sink.clone()),
                _ => None,
            })
            .collect()
    }

    /// An immutable copy of the ledger in insertion order.
    pub fn snapshot(&self) -> Snapshot {
        let entries = self.lock().ordered.values().cloned().collect::<Vec<_>>();

        Snapshot {
            entries: entries.into(),
        }
    }
}

/// An immutable, insertion-ordered copy of the ledger.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    entries: Arc<[LedgerEntry]>,
}

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    /// Entries of one replay tier, keeping the insertion order.
    pub fn tier(&self, tier: Tier) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().filter(move |e| e.entity.tier() == tier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
