//! Deletion guard removes ledger entries of deleted entities.
//!
//! The entry is forgotten only after the server confirmed the delete, unbind or cancel call. If
//! the call failed, or the connection dropped while it was in flight, the entry stays and the
//! entity is recreated by the next recovery.
use crate::{
    consumer::ConsumerSignal,
    ledger::{LedgerEntry, TopologyLedger},
    topology::{Entity, Identity},
    transport::BrokerResult,
};
use log::{debug, warn};
use std::future::Future;

#[derive(Clone)]
pub struct DeletionGuard {
    ledger: TopologyLedger,
}

impl DeletionGuard {
    pub fn new(ledger: TopologyLedger) -> Self {
        DeletionGuard { ledger }
    }

    /// Run the call which deletes `identity` on the server and forget the identity if the
    /// server confirmed it. A "not found" answer also means that the entity is not there anymore.
    pub async fn guard<T, F>(&self, identity: Identity, call: F) -> BrokerResult<T>
    where
        F: Future<Output = BrokerResult<T>>,
    {
        let result = call.await;

        match &result {
            Ok(_) => {
                self.confirmed(&identity);
            }
            Err(e) if e.is_not_found() => {
                debug!("{identity} was already gone on the server");

                self.confirmed(&identity);
            }
            Err(e) => {
                warn!("Deleting {identity} failed, it is kept for recovery: {e}");
            }
        }

        result
    }

    fn confirmed(&self, identity: &Identity) {
        let removed = match identity {
            Identity::Exchange(_) | Identity::Queue(_) => self.ledger.forget_with_dependents(identity),
            Identity::Binding(key) => {
                let mut removed = self.ledger.forget(identity).into_iter().collect::<Vec<_>>();

                removed.extend(self.ledger.forget_auto_deleted_exchange(&key.source));
                removed
            }
            Identity::Consumer(_) => {
                let mut removed = self.ledger.forget(identity).into_iter().collect::<Vec<_>>();

                let queue = removed.first().and_then(|e| e.entity.required_queue().map(str::to_string));

                if let Some(queue) = queue {
                    removed.extend(self.ledger.forget_auto_deleted_queue(&queue));
                }

                removed
            }
        };

        notify_cancelled(&removed);
    }
}

/// Tell the consumers among the forgotten entries that they won't get more messages.
pub(crate) fn notify_cancelled(removed: &[LedgerEntry]) {
    for entry in removed {
        if let Entity::Consumer(c) = &entry.entity {
            // the application may have dropped the handler already
            let _ = c.sink.send(ConsumerSignal::Cancelled);
        }
    }
}
