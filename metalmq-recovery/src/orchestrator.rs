//! Recovery orchestrator, the background task of a connection.
//!
//! It waits for the close signals of the transport. An unexpected close of the current session
//! starts a recovery cycle: connect again, reopen the channels, replay the topology. Failed
//! attempts are retried with backoff until the retry budget runs out or a fatal error happens.
mod replay;

pub use replay::ReplayReport;
pub(crate) use replay::replay;

use crate::{
    backoff::Backoff,
    channel::ChannelRecoveryManager,
    connection::Shared,
    error::ClientError,
    model::LocalError,
    state::ConnectionState,
    transport::{self, BrokerResult, CloseReason, Connector, SignalSink, TransportSignal},
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) struct RecoveryOrchestrator {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    signal_sink: SignalSink,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    cancel: CancellationToken,
    backoff: Backoff,
    channel_manager: ChannelRecoveryManager,
}

impl RecoveryOrchestrator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        signal_sink: SignalSink,
        signals: mpsc::UnboundedReceiver<TransportSignal>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(&shared.config.backoff);
        let channel_manager =
            ChannelRecoveryManager::new(shared.config.operation_timeout(), shared.config.recovery_channel);

        RecoveryOrchestrator {
            shared,
            connector,
            signal_sink,
            signals,
            cancel,
            backoff,
            channel_manager,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = self.signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            let TransportSignal::Closed { session_id, reason } = signal;

            if !self.shared.session.is_current(&session_id) {
                debug!("Ignoring close of replaced session {session_id}");
                continue;
            }

            let cause = match reason {
                CloseReason::Application => {
                    debug!("Session {session_id} is closed by the application");
                    continue;
                }
                CloseReason::Unexpected(cause) => cause,
            };

            match self.shared.tracker.state() {
                ConnectionState::Connected => {}
                ConnectionState::Closed | ConnectionState::RecoveryFailed => break,
                state => {
                    debug!("Ignoring close of session {session_id} in state {state}");
                    continue;
                }
            }

            self.shared.tracker.disconnected(cause.clone());

            if !self.shared.config.automatic_recovery {
                info!("Automatic recovery is disabled, connection stays disconnected");

                self.shared.notify_consumers_closed(&cause);
                break;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Recovery is cancelled");
                    break;
                }
                result = self.recover() => result,
            };

            if let Err(e) = result {
                self.shared.tracker.recovery_failed(e.clone());
                self.shared.notify_consumers_closed(&e);
                break;
            }
        }

        debug!("Recovery task of connection is finished");
    }

    /// Run recovery attempts until one succeeds, the retry budget is exhausted or an error is
    /// fatal.
    async fn recover(&self) -> BrokerResult<()> {
        let max_attempts = self.shared.config.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;

            self.shared.tracker.recovering(attempt);

            match self.attempt().await {
                Ok(()) => {
                    self.shared.tracker.connected();

                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    if max_attempts.is_some_and(|max| attempt >= max) {
                        error!("Giving up recovery after {attempt} attempts");

                        return Err(ClientError::local(
                            LocalError::RecoveryFailed,
                            &format!("Recovery failed after {attempt} attempts, last error: {}", e.message),
                        ));
                    }

                    let delay = self.backoff.delay(attempt);

                    warn!("Recovery attempt {attempt} failed, retrying in {delay:?}: {e}");

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("Recovery failed with a non-retryable error: {e}");

                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self) -> BrokerResult<()> {
        let config = &self.shared.config;
        let session = transport::with_timeout(
            config.connect_timeout(),
            "Connect",
            self.connector.connect(self.signal_sink.clone()),
        )
        .await?;

        info!("Connected again with session {}", session.id());

        self.shared.session.replace(session.clone());

        let recovery = self
            .channel_manager
            .recover(session, self.shared.channels.snapshot())
            .await?;

        for failure in &recovery.failures {
            self.shared
                .tracker
                .channel_recovery_failed(failure.channel, failure.cause.clone());
            self.shared.drop_channel(failure.channel, &failure.cause);
        }

        if !config.topology_recovery {
            return Ok(());
        }

        let mut live = recovery.live;
        let report = replay(&self.shared.ledger.snapshot(), &mut live, config.replay_concurrency).await?;

        self.shared.settle_replay(&report, true);

        info!(
            "Topology is recovered, {} entries replayed, {} skipped",
            report.replayed,
            report.absent.len() + report.excluded.len()
        );

        Ok(())
    }
}
