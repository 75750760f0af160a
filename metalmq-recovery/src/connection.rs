use crate::{
    channel::{ChannelRegistry, LiveChannels},
    channel_api::Channel,
    config::RecoveryConfig,
    consumer::ConsumerSignal,
    error::ClientError,
    guard::{self, DeletionGuard},
    ledger::{Snapshot, TopologyLedger},
    model::{self, ChannelNumber, ConnectionError},
    orchestrator::{self, RecoveryOrchestrator, ReplayReport},
    state::{ConnectionState, ConnectionStateTracker, StateEvent},
    topology::Identity,
    transport::{self, Command, Connector, SessionSlot},
};
use anyhow::Result;
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// State shared by the connection, its channels and the recovery task.
pub(crate) struct Shared {
    pub(crate) config: RecoveryConfig,
    pub(crate) ledger: TopologyLedger,
    pub(crate) guard: DeletionGuard,
    pub(crate) channels: ChannelRegistry,
    pub(crate) tracker: ConnectionStateTracker,
    pub(crate) session: SessionSlot,
}

impl Shared {
    /// Forget a channel which is closed by the application or by the server. Its consumers are
    /// cancelled on the server, so they are forgotten, too.
    pub(crate) fn drop_channel(&self, channel: ChannelNumber, cause: &ClientError) {
        self.channels.remove(channel);

        let consumers = self.ledger.forget_channel_consumers(channel);
        let mut queues = BTreeSet::new();

        for consumer in consumers {
            let _ = consumer.sink.send(ConsumerSignal::ChannelClosed {
                reply_code: cause.code,
                reply_text: cause.message.clone(),
                class_method: cause.class_method,
            });

            queues.insert(consumer.queue);
        }

        for queue in queues {
            self.ledger.forget_auto_deleted_queue(&queue);
        }
    }

    /// Tell all the consumers that the connection is gone for good.
    pub(crate) fn notify_consumers_closed(&self, cause: &ClientError) {
        for sink in self.ledger.consumer_sinks() {
            let _ = sink.send(ConsumerSignal::ConnectionClosed {
                reply_code: cause.code,
                reply_text: cause.message.clone(),
                class_method: cause.class_method,
            });
        }
    }

    /// Forget what a replay found missing on the server. Consumers of missing queues are
    /// cancelled, and after a reconnect the server-named queues are gone as well.
    pub(crate) fn settle_replay(&self, report: &ReplayReport, reconnected: bool) {
        for identity in &report.absent {
            if let Identity::Consumer(_) = identity {
                if let Some(entry) = self.ledger.forget(identity) {
                    guard::notify_cancelled(&[entry]);
                }
            }
        }

        if reconnected {
            for queue in &report.excluded {
                let removed = self.ledger.forget_with_dependents(&Identity::Queue(queue.clone()));

                guard::notify_cancelled(&removed);
            }
        }
    }
}

/// A connection which recovers itself after network failures.
///
/// It owns the topology ledger, every exchange, queue, binding and consumer declared through its
/// channels is recorded and declared again after a reconnect.
pub struct Connection {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Connection {
    /// Connect to the server and start the recovery task. The first connect is not retried,
    /// its error is returned.
    pub async fn open(connector: Arc<dyn Connector>, config: RecoveryConfig) -> Result<Connection> {
        let (signal_sink, signals) = mpsc::unbounded_channel();

        let session = transport::with_timeout(
            config.connect_timeout(),
            "Connect",
            connector.connect(signal_sink.clone()),
        )
        .await?;

        info!("Connection {} is open", session.id());

        let ledger = TopologyLedger::new();
        let tracker = ConnectionStateTracker::new(config.gate, config.automatic_recovery, config.event_capacity);
        let shared = Arc::new(Shared {
            guard: DeletionGuard::new(ledger.clone()),
            ledger,
            channels: ChannelRegistry::default(),
            tracker,
            session: SessionSlot::new(session),
            config,
        });
        let cancel = CancellationToken::new();

        let orchestrator = RecoveryOrchestrator::new(shared.clone(), connector, signal_sink, signals, cancel.clone());

        tokio::spawn(orchestrator.run());

        Ok(Connection { shared, cancel })
    }

    /// Identifier of the current physical connection, it changes after every reconnect.
    pub fn id(&self) -> String {
        self.shared.session.current().id()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.tracker.state()
    }

    /// The error which made the recovery fail.
    pub fn failure(&self) -> Option<ClientError> {
        self.shared.tracker.failure()
    }

    /// Stream of the state changes from now on.
    pub fn events(&self) -> BroadcastStream<StateEvent> {
        BroadcastStream::new(self.shared.tracker.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.shared.tracker.subscribe()
    }

    /// Open a channel with the given number.
    pub async fn channel_open(&self, channel: ChannelNumber) -> Result<Channel> {
        self.shared.tracker.admit().await?;

        if channel == 0 || channel == self.shared.config.recovery_channel {
            return crate::client_error!(
                None,
                ConnectionError::ChannelError as u16,
                format!("Channel {channel} is reserved"),
                model::CHANNEL_OPEN
            );
        }

        if !self.shared.channels.insert(channel) {
            return crate::client_error!(
                None,
                ConnectionError::ChannelError as u16,
                format!("Channel {channel} is already open"),
                model::CHANNEL_OPEN
            );
        }

        let session = self.shared.session.current();

        if let Err(e) = transport::call(
            session.as_ref(),
            channel,
            Command::ChannelOpen,
            self.shared.config.operation_timeout(),
        )
        .await
        {
            self.shared.channels.remove(channel);

            return Err(e.into());
        }

        Ok(Channel::new(channel, self.shared.clone()))
    }

    /// Copy of the recorded topology in replay order.
    pub fn topology(&self) -> Snapshot {
        self.shared.ledger.snapshot()
    }

    /// Declare the recorded topology again on the live connection. It can be used after the
    /// server lost entities without the connection being dropped.
    ///
    /// Calls on the open channels wait until the replay is finished.
    pub async fn replay_topology(&self) -> Result<ReplayReport> {
        self.shared.tracker.admit().await?;

        let _serials = self.shared.channels.lock_all().await;

        let mut live = LiveChannels::existing(
            self.shared.session.current(),
            self.shared.channels.snapshot(),
            self.shared.config.recovery_channel,
            self.shared.config.operation_timeout(),
        );

        let report = orchestrator::replay(&self.shared.ledger.snapshot(), &mut live, self.shared.config.replay_concurrency)
            .await?;

        self.shared.settle_replay(&report, false);

        Ok(report)
    }

    /// Close the connection. It stops the recovery for good, even a recovery in progress.
    pub async fn close(&self) -> Result<()> {
        let was_connected = self.state() == ConnectionState::Connected;

        if !self.shared.tracker.closed() {
            return Ok(());
        }

        self.cancel.cancel();

        let reason = ClientError {
            channel: None,
            code: 200,
            message: "Connection closed by the application".to_string(),
            class_method: model::CONNECTION_CLOSE,
        };

        self.shared.notify_consumers_closed(&reason);

        let session = self.shared.session.current();
        let result = transport::with_timeout(self.shared.config.operation_timeout(), "Close", session.close()).await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if was_connected => Err(e.into()),
            Err(e) => {
                warn!("Closing the broken session failed: {e}");

                Ok(())
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("entries", &self.shared.ledger.len())
            .finish()
    }
}
