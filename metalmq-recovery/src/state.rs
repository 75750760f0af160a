//! Connection state tracker, the lifecycle of the connection as the application sees it.
//!
//! The current state is in a `watch` channel, so operations waiting for the end of a recovery can
//! be woken up, and every transition is published as a [`StateEvent`] on a broadcast channel.
use crate::{
    config::GateMode,
    error::ClientError,
    model::{ChannelNumber, LocalError},
    transport::BrokerResult,
};
use log::{info, warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Recovering,
    /// Automatic recovery gave up, the connection cannot be used anymore.
    RecoveryFailed,
    /// The application closed the connection.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connected, Disconnected)
                | (Connected, Closed)
                | (Disconnected, Recovering)
                | (Disconnected, Closed)
                | (Recovering, Recovering)
                | (Recovering, Connected)
                | (Recovering, RecoveryFailed)
                | (Recovering, Closed)
                | (RecoveryFailed, Closed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateEvent {
    Connected,
    Disconnected { cause: ClientError },
    Recovering { attempt: u32 },
    ChannelRecoveryFailed { channel: ChannelNumber, cause: ClientError },
    RecoveryFailed { cause: ClientError },
    Closed,
}

pub(crate) struct ConnectionStateTracker {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StateEvent>,
    failure: Mutex<Option<ClientError>>,
    gate: GateMode,
    /// After a disconnect a recovery is coming, operations are gated rather than failed.
    recovers: bool,
    waiting: AtomicUsize,
}

/// Decrements the number of waiting operations when the waiting is over.
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionStateTracker {
    pub(crate) fn new(gate: GateMode, recovers: bool, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (events, _) = broadcast::channel(event_capacity.max(1));

        ConnectionStateTracker {
            state,
            events,
            failure: Mutex::new(None),
            gate,
            recovers,
            waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// The cause of the `RecoveryFailed` state.
    pub(crate) fn failure(&self) -> Option<ClientError> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn transition(&self, next: ConnectionState, event: StateEvent) -> bool {
        let mut changed = false;

        self.state.send_if_modified(|current| {
            if current.can_become(next) {
                *current = next;
                changed = true;
            }
            changed
        });

        if changed {
            // nobody may listen
            let _ = self.events.send(event);
        } else {
            warn!("Ignoring state change from {} to {next}", self.state());
        }

        changed
    }

    pub(crate) fn connected(&self) -> bool {
        let ok = self.transition(ConnectionState::Connected, StateEvent::Connected);

        if ok {
            info!("Connection is recovered");
        }

        ok
    }

    pub(crate) fn disconnected(&self, cause: ClientError) -> bool {
        warn!("Connection is lost: {cause}");

        self.transition(ConnectionState::Disconnected, StateEvent::Disconnected { cause })
    }

    pub(crate) fn recovering(&self, attempt: u32) -> bool {
        info!("Recovering connection, attempt {attempt}");

        self.transition(ConnectionState::Recovering, StateEvent::Recovering { attempt })
    }

    pub(crate) fn recovery_failed(&self, cause: ClientError) -> bool {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(cause.clone());

        warn!("Connection recovery failed: {cause}");

        self.transition(ConnectionState::RecoveryFailed, StateEvent::RecoveryFailed { cause })
    }

    pub(crate) fn closed(&self) -> bool {
        self.transition(ConnectionState::Closed, StateEvent::Closed)
    }

    /// Not a state change, only an event about a channel which couldn't be reopened.
    pub(crate) fn channel_recovery_failed(&self, channel: ChannelNumber, cause: ClientError) {
        warn!("Channel {channel} cannot be recovered: {cause}");

        let _ = self.events.send(StateEvent::ChannelRecoveryFailed { channel, cause });
    }

    /// Let an application operation proceed. During recovery the operation waits or fails
    /// depending on the gate mode.
    pub(crate) async fn admit(&self) -> BrokerResult<()> {
        let mut rx = self.state.subscribe();
        let mut waiting = None;

        loop {
            let state = *rx.borrow_and_update();

            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ClientError::local(LocalError::Closed, "Connection is closed")),
                ConnectionState::RecoveryFailed => {
                    let cause = self
                        .failure()
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown cause".to_string());

                    return Err(ClientError::local(
                        LocalError::RecoveryFailed,
                        &format!("Connection recovery failed: {cause}"),
                    ));
                }
                ConnectionState::Disconnected if !self.recovers => {
                    return Err(ClientError::connection_lost("Connection is lost"));
                }
                ConnectionState::Disconnected | ConnectionState::Recovering => match self.gate {
                    GateMode::FailFast => {
                        return Err(ClientError::local(LocalError::Recovering, "Connection is recovering"));
                    }
                    GateMode::Queue { capacity } => {
                        if waiting.is_none() {
                            if self.waiting.fetch_add(1, Ordering::SeqCst) >= capacity {
                                self.waiting.fetch_sub(1, Ordering::SeqCst);

                                return Err(ClientError::local(
                                    LocalError::QueueFull,
                                    "Too many operations wait for the recovery",
                                ));
                            }

                            waiting = Some(Waiting(&self.waiting));
                        }

                        if rx.changed().await.is_err() {
                            return Err(ClientError::local(LocalError::Closed, "Connection is closed"));
                        }
                    }
                },
            }
        }
    }
}
