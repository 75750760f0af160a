//! Channel bookkeeping and the channel recovery manager.
//!
//! The registry keeps the settings of every channel the application opened. After a reconnect
//! the recovery manager opens the same channel numbers on the new session and applies the settings
//! again, so the application can keep using its [`Channel`](crate::Channel) handles.
use crate::{
    error::ClientError,
    model::ChannelNumber,
    transport::{self, BrokerResult, Command, Reply, Session},
};
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Qos {
    pub prefetch_count: u16,
    pub global: bool,
}

/// Settings of a channel which need to be restored after a reconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelSettings {
    pub qos: Option<Qos>,
    pub transactional: bool,
    pub confirm: bool,
}

/// Lock which serializes the calls made on one channel.
pub(crate) type SerialLock = Arc<tokio::sync::Mutex<()>>;

struct OpenChannel {
    settings: ChannelSettings,
    serial: SerialLock,
}

#[derive(Clone, Default)]
pub(crate) struct ChannelRegistry {
    channels: Arc<Mutex<BTreeMap<ChannelNumber, OpenChannel>>>,
}

impl ChannelRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ChannelNumber, OpenChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new channel, it returns false if the channel is already open.
    pub(crate) fn insert(&self, channel: ChannelNumber) -> bool {
        let mut channels = self.lock();

        if channels.contains_key(&channel) {
            return false;
        }

        channels.insert(
            channel,
            OpenChannel {
                settings: ChannelSettings::default(),
                serial: SerialLock::default(),
            },
        );
        true
    }

    pub(crate) fn update<F>(&self, channel: ChannelNumber, f: F)
    where
        F: FnOnce(&mut ChannelSettings),
    {
        if let Some(open) = self.lock().get_mut(&channel) {
            f(&mut open.settings);
        }
    }

    pub(crate) fn remove(&self, channel: ChannelNumber) -> Option<ChannelSettings> {
        self.lock().remove(&channel).map(|open| open.settings)
    }

    /// The call lock of an open channel.
    pub(crate) fn serial(&self, channel: ChannelNumber) -> Option<SerialLock> {
        self.lock().get(&channel).map(|open| open.serial.clone())
    }

    /// Take the call lock of every open channel, in channel number order.
    pub(crate) async fn lock_all(&self) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let serials = self.lock().values().map(|open| open.serial.clone()).collect::<Vec<_>>();
        let mut guards = Vec::with_capacity(serials.len());

        for serial in serials {
            guards.push(serial.lock_owned().await);
        }

        guards
    }

    pub(crate) fn snapshot(&self) -> Vec<(ChannelNumber, ChannelSettings)> {
        self.lock().iter().map(|(ch, open)| (*ch, open.settings)).collect()
    }
}

/// Open a channel and apply its settings: prefetch, confirm mode and transactional mode.
pub(crate) async fn open_with_settings(
    session: &dyn Session,
    channel: ChannelNumber,
    settings: &ChannelSettings,
    timeout: Duration,
) -> BrokerResult<()> {
    transport::call(session, channel, Command::ChannelOpen, timeout).await?;

    if let Some(qos) = settings.qos {
        transport::call(
            session,
            channel,
            Command::BasicQos {
                prefetch_count: qos.prefetch_count,
                global: qos.global,
            },
            timeout,
        )
        .await?;
    }

    if settings.confirm {
        transport::call(session, channel, Command::ConfirmSelect, timeout).await?;
    }

    if settings.transactional {
        transport::call(session, channel, Command::TxSelect, timeout).await?;
    }

    trace!("Channel {channel} is open with {settings:?}");

    Ok(())
}

/// A channel which couldn't be reopened during recovery.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: ChannelNumber,
    pub cause: ClientError,
}

pub(crate) struct ChannelRecovery {
    pub(crate) live: LiveChannels,
    pub(crate) failures: Vec<ChannelFailure>,
}

pub(crate) struct ChannelRecoveryManager {
    timeout: Duration,
    recovery_channel: ChannelNumber,
}

impl ChannelRecoveryManager {
    pub(crate) fn new(timeout: Duration, recovery_channel: ChannelNumber) -> Self {
        ChannelRecoveryManager {
            timeout,
            recovery_channel,
        }
    }

    /// Reopen the channels on a new session.
    ///
    /// A channel error is reported for that channel and the others are still reopened. A
    /// retryable error or a connection error fails the whole recovery.
    pub(crate) async fn recover(
        &self,
        session: Arc<dyn Session>,
        channels: Vec<(ChannelNumber, ChannelSettings)>,
    ) -> BrokerResult<ChannelRecovery> {
        let mut live = BTreeMap::new();
        let mut failures = vec![];

        for (channel, settings) in channels {
            match open_with_settings(session.as_ref(), channel, &settings, self.timeout).await {
                Ok(()) => {
                    debug!("Channel {channel} is recovered");

                    live.insert(channel, settings);
                }
                Err(e) if e.is_retryable() || e.channel.is_none() => return Err(e),
                Err(cause) => {
                    warn!("Channel {channel} cannot be reopened: {cause}");

                    failures.push(ChannelFailure { channel, cause });
                }
            }
        }

        Ok(ChannelRecovery {
            live: LiveChannels {
                session,
                channels: live,
                recovery_channel: self.recovery_channel,
                fallback_open: false,
                timeout: self.timeout,
            },
            failures,
        })
    }
}

/// The channels which are open on the current session, the topology replay runs on them.
pub(crate) struct LiveChannels {
    session: Arc<dyn Session>,
    channels: BTreeMap<ChannelNumber, ChannelSettings>,
    recovery_channel: ChannelNumber,
    fallback_open: bool,
    timeout: Duration,
}

impl LiveChannels {
    /// The channels of a session which is already running, without reopening them.
    pub(crate) fn existing(
        session: Arc<dyn Session>,
        channels: Vec<(ChannelNumber, ChannelSettings)>,
        recovery_channel: ChannelNumber,
        timeout: Duration,
    ) -> Self {
        LiveChannels {
            session,
            channels: channels.into_iter().collect(),
            recovery_channel,
            fallback_open: false,
            timeout,
        }
    }

    pub(crate) fn contains(&self, channel: ChannelNumber) -> bool {
        self.channels.contains_key(&channel)
    }

    /// The channel where an entry declared on `channel` can be replayed.
    pub(crate) fn route(&self, channel: ChannelNumber) -> ChannelNumber {
        if self.contains(channel) {
            channel
        } else {
            self.recovery_channel
        }
    }

    pub(crate) async fn call(&self, channel: ChannelNumber, command: Command) -> BrokerResult<Reply> {
        transport::call(self.session.as_ref(), channel, command, self.timeout).await
    }

    /// Open the channel again after the server closed it because of a channel error.
    pub(crate) async fn reopen(&self, channel: ChannelNumber) -> BrokerResult<()> {
        let settings = self.channels.get(&channel).copied().unwrap_or_default();

        debug!("Reopening channel {channel} closed by the server");

        open_with_settings(self.session.as_ref(), channel, &settings, self.timeout).await
    }

    /// Open the recovery channel for the entries whose channel was closed since they had been
    /// declared.
    pub(crate) async fn open_fallback(&mut self) -> BrokerResult<()> {
        if self.fallback_open {
            return Ok(());
        }

        debug!("Opening recovery channel {}", self.recovery_channel);

        transport::call(self.session.as_ref(), self.recovery_channel, Command::ChannelOpen, self.timeout).await?;
        self.fallback_open = true;

        Ok(())
    }

    pub(crate) async fn close_fallback(&mut self) {
        if !self.fallback_open {
            return;
        }

        self.fallback_open = false;

        if let Err(e) = self.call(self.recovery_channel, Command::ChannelClose).await {
            warn!("Closing recovery channel failed: {e}");
        }
    }
}
