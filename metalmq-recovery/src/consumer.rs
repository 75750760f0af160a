use std::time::Duration;

use crate::{channel_api::Channel, message::DeliveredMessage, model::ChannelNumber};
use anyhow::Result;
use tokio::sync::mpsc;

/// The stable handle of a consumer. The transport delivers the messages here and recovery
/// registers the same sink again on the new connection.
pub type ConsumerSink = mpsc::UnboundedSender<ConsumerSignal>;

/// A signal arriving from the server during consuming a queue.
#[derive(Debug)]
pub enum ConsumerSignal {
    Delivered(Box<DeliveredMessage>),
    Cancelled,
    ChannelClosed {
        reply_code: u16,
        reply_text: String,
        class_method: u32,
    },
    ConnectionClosed {
        reply_code: u16,
        reply_text: String,
        class_method: u32,
    },
}

/// Consumer API for `Basic.Consume`.
///
/// `ConsumerHandler` can be get by invoking [`Channel::basic_consume`]. The handler survives the
/// recoveries of the connection, the signal stream keeps delivering the messages.
pub struct ConsumerHandler {
    /// The channel number we are consuming messages.
    pub channel: ChannelNumber,
    /// Identifier of the consumer in server.
    pub consumer_tag: String,
    handle: Channel,
    /// From this signal stream the consumer gets the messages as [`ConsumerSignal`] values and can
    /// handle them by acking messages or handling channel or connection close events.
    pub signal_stream: mpsc::UnboundedReceiver<ConsumerSignal>,
}

impl ConsumerHandler {
    pub(crate) fn new(
        handle: Channel,
        consumer_tag: String,
        signal_stream: mpsc::UnboundedReceiver<ConsumerSignal>,
    ) -> Self {
        ConsumerHandler {
            channel: handle.channel,
            consumer_tag,
            handle,
            signal_stream,
        }
    }

    pub async fn receive(&mut self, timeout: Duration) -> Option<ConsumerSignal> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            signal = self.signal_stream.recv() => {
                signal
            }
            _ = &mut sleep => {
                None
            }
        }
    }

    pub async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.handle.basic_ack(delivery_tag, false).await
    }

    /// Cancel consuming. Once the server confirmed the cancel, the consumer is not recovered
    /// anymore.
    pub async fn basic_cancel(self) -> Result<()> {
        self.handle.basic_cancel(&self.consumer_tag).await
    }
}
