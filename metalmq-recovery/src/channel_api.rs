use crate::{
    connection::Shared,
    consumer::{ConsumerHandler, ConsumerSignal},
    error::ClientError,
    message::Content,
    model::{self, ChannelNumber, ConnectionError},
    topology::{
        BindingSpec, ConsumeFlags, ConsumerSpec, Entity, ExchangeFlags, ExchangeSpec, ExchangeType, FieldTable,
        FieldValue, Identity, QueueFlags, QueueSpec,
    },
    transport::{self, BrokerResult, Command, QueueDeclareOk, Reply},
};
use anyhow::Result;
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A channel of a recovering connection.
///
/// The channel keeps its number over recoveries. Calls on one channel are serialized, calls on
/// different channels run concurrently. During recovery the calls wait or fail depending on the
/// gate configuration.
#[derive(Clone)]
pub struct Channel {
    pub channel: ChannelNumber,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("channel", &self.channel).finish()
    }
}

/// Specify if the exchange or queue needs to survive the server restart.
pub struct Durable(pub bool);
/// Specify if the server deletes the exchange or queue when it is not used anymore.
pub struct AutoDelete(pub bool);
/// Specify if the exchange cannot be published to, only be bound to other exchanges.
pub struct Internal(pub bool);
/// Specify if the queue or the consume is exclusive aka no other client can use it.
pub struct Exclusive(pub bool);
/// Delete the exchange or queue only if it is not used.
pub struct IfUnused(pub bool);
/// Delete the queue only if it is empty.
pub struct IfEmpty(pub bool);
/// Specify if the client needs to ack messages after delivery.
pub struct NoAck(pub bool);
/// Specify if the server sends messages to the same connection which published them.
pub struct NoLocal(pub bool);

/// Options of the exchange declare.
///
/// A passive declare only checks if the exchange exists, it is not recorded for recovery.
#[derive(Debug, Default)]
pub struct ExchangeDeclareOpts {
    pub passive: bool,
    pub flags: ExchangeFlags,
    pub arguments: FieldTable,
}

impl ExchangeDeclareOpts {
    pub fn passive(mut self, mode: bool) -> Self {
        self.passive = mode;
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeFlags::DURABLE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeFlags::AUTO_DELETE, mode);
        self
    }

    pub fn internal(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeFlags::INTERNAL, mode);
        self
    }

    pub fn argument(mut self, name: &str, value: FieldValue) -> Self {
        self.arguments.insert(name.to_string(), value);
        self
    }
}

/// Options of the queue declare.
///
/// A passive declare only checks if the queue exists, it is not recorded for recovery.
#[derive(Debug, Default)]
pub struct QueueDeclareOpts {
    pub passive: bool,
    pub flags: QueueFlags,
    pub arguments: FieldTable,
}

impl QueueDeclareOpts {
    pub fn passive(mut self, mode: bool) -> Self {
        self.passive = mode;
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(QueueFlags::DURABLE, mode);
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.flags.set(QueueFlags::EXCLUSIVE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(QueueFlags::AUTO_DELETE, mode);
        self
    }

    pub fn argument(mut self, name: &str, value: FieldValue) -> Self {
        self.arguments.insert(name.to_string(), value);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderMatch {
    Any,
    All,
    AnyWithX,
    AllWithX,
}

impl HeaderMatch {
    fn as_str(&self) -> &'static str {
        match self {
            HeaderMatch::Any => "any",
            HeaderMatch::All => "all",
            HeaderMatch::AnyWithX => "any-with-x",
            HeaderMatch::AllWithX => "all-with-x",
        }
    }
}

/// How messages are routed through a binding, depending on the type of the source exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    Direct(String),
    Topic(String),
    Fanout,
    Headers { headers: FieldTable, x_match: HeaderMatch },
}

impl Binding {
    fn routing_key_and_arguments(self) -> (String, FieldTable) {
        match self {
            Binding::Direct(routing_key) | Binding::Topic(routing_key) => (routing_key, FieldTable::new()),
            Binding::Fanout => (String::new(), FieldTable::new()),
            Binding::Headers { mut headers, x_match } => {
                headers.insert("x-match".to_string(), x_match.as_str().into());

                (String::new(), headers)
            }
        }
    }

    fn to_queue(self, queue_name: &str, exchange_name: &str) -> BindingSpec {
        let (routing_key, arguments) = self.routing_key_and_arguments();

        BindingSpec::queue(queue_name, exchange_name, &routing_key).arguments(arguments)
    }

    fn to_exchange(self, destination: &str, source: &str) -> BindingSpec {
        let (routing_key, arguments) = self.routing_key_and_arguments();

        BindingSpec::exchange(destination, source, &routing_key).arguments(arguments)
    }
}

impl Channel {
    pub(crate) fn new(channel: ChannelNumber, shared: Arc<Shared>) -> Channel {
        Channel { channel, shared }
    }

    async fn call(&self, command: Command) -> BrokerResult<Reply> {
        self.shared.tracker.admit().await?;

        let class_method = command.class_method();

        let Some(serial) = self.shared.channels.serial(self.channel) else {
            return Err(ClientError {
                channel: Some(self.channel),
                code: ConnectionError::ChannelError as u16,
                message: format!("Channel {} is closed", self.channel),
                class_method,
            });
        };

        let _serial = serial.lock().await;
        let session = self.shared.session.current();
        let result = transport::call(
            session.as_ref(),
            self.channel,
            command,
            self.shared.config.operation_timeout(),
        )
        .await;

        if let Err(e) = &result {
            // channel errors close the channel on the server side
            if e.channel == Some(self.channel) {
                debug!("Channel {} is closed by the server: {e}", self.channel);

                self.shared.drop_channel(self.channel, e);
            }
        }

        result
    }

    /// Declare an exchange. Non-passive declares are recorded and recovered.
    pub async fn exchange_declare(
        &self,
        exchange_name: &str,
        exchange_type: ExchangeType,
        opts: ExchangeDeclareOpts,
    ) -> Result<()> {
        let spec = ExchangeSpec {
            name: exchange_name.to_string(),
            exchange_type,
            flags: opts.flags,
            arguments: opts.arguments,
        };

        self.call(Command::ExchangeDeclare {
            exchange: spec.clone(),
            passive: opts.passive,
        })
        .await?;

        if !opts.passive {
            self.shared.ledger.record(self.channel, Entity::Exchange(spec));
        }

        Ok(())
    }

    /// Delete an exchange. Once the server confirmed it, the exchange and its bindings are not
    /// recovered anymore.
    pub async fn exchange_delete(&self, exchange_name: &str, if_unused: IfUnused) -> Result<()> {
        let command = Command::ExchangeDelete {
            exchange_name: exchange_name.to_string(),
            if_unused: if_unused.0,
        };

        self.shared
            .guard
            .guard(Identity::Exchange(exchange_name.to_string()), self.call(command))
            .await?;

        Ok(())
    }

    /// Bind the `destination` exchange to the `source` exchange.
    pub async fn exchange_bind(&self, destination: &str, source: &str, binding: Binding) -> Result<()> {
        let spec = binding.to_exchange(destination, source);

        self.call(Command::ExchangeBind(spec.clone())).await?;
        self.shared.ledger.record(self.channel, Entity::Binding(spec));

        Ok(())
    }

    pub async fn exchange_unbind(&self, destination: &str, source: &str, binding: Binding) -> Result<()> {
        let spec = binding.to_exchange(destination, source);

        self.shared
            .guard
            .guard(Identity::Binding(spec.key()), self.call(Command::ExchangeUnbind(spec)))
            .await?;

        Ok(())
    }

    /// Declare a queue. If the name is empty, the server generates one. Such a queue is not
    /// recovered.
    pub async fn queue_declare(&self, queue_name: &str, opts: QueueDeclareOpts) -> Result<QueueDeclareOk> {
        let spec = QueueSpec {
            name: queue_name.to_string(),
            flags: opts.flags,
            arguments: opts.arguments,
            server_named: queue_name.is_empty(),
        };

        let reply = self
            .call(Command::QueueDeclare {
                queue: spec.clone(),
                passive: opts.passive,
            })
            .await?;

        let ok = match reply {
            Reply::QueueDeclared(ok) => ok,
            _ => QueueDeclareOk {
                queue_name: queue_name.to_string(),
                ..Default::default()
            },
        };

        if !opts.passive {
            self.shared.ledger.record(
                self.channel,
                Entity::Queue(QueueSpec {
                    name: ok.queue_name.clone(),
                    ..spec
                }),
            );
        }

        Ok(ok)
    }

    /// Bind a queue to an exchange.
    pub async fn queue_bind(&self, queue_name: &str, exchange_name: &str, binding: Binding) -> Result<()> {
        let spec = binding.to_queue(queue_name, exchange_name);

        self.call(Command::QueueBind(spec.clone())).await?;
        self.shared.ledger.record(self.channel, Entity::Binding(spec));

        Ok(())
    }

    pub async fn queue_unbind(&self, queue_name: &str, exchange_name: &str, binding: Binding) -> Result<()> {
        let spec = binding.to_queue(queue_name, exchange_name);

        self.shared
            .guard
            .guard(Identity::Binding(spec.key()), self.call(Command::QueueUnbind(spec)))
            .await?;

        Ok(())
    }

    /// Delete a queue. Once the server confirmed it, the queue, its bindings and consumers are not
    /// recovered anymore.
    pub async fn queue_delete(&self, queue_name: &str, if_unused: IfUnused, if_empty: IfEmpty) -> Result<()> {
        let command = Command::QueueDelete {
            queue_name: queue_name.to_string(),
            if_unused: if_unused.0,
            if_empty: if_empty.0,
        };

        self.shared
            .guard
            .guard(Identity::Queue(queue_name.to_string()), self.call(command))
            .await?;

        Ok(())
    }

    /// Set the prefetch of the channel. It is applied again after recovery.
    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<()> {
        self.call(Command::BasicQos { prefetch_count, global }).await?;
        self.shared.channels.update(self.channel, |s| {
            s.qos = Some(crate::channel::Qos { prefetch_count, global })
        });

        Ok(())
    }

    /// Put the channel into transactional mode. It is applied again after recovery.
    pub async fn tx_select(&self) -> Result<()> {
        self.call(Command::TxSelect).await?;
        self.shared.channels.update(self.channel, |s| s.transactional = true);

        Ok(())
    }

    /// Put the channel into publisher confirm mode. It is applied again after recovery.
    pub async fn confirm_select(&self) -> Result<()> {
        self.call(Command::ConfirmSelect).await?;
        self.shared.channels.update(self.channel, |s| s.confirm = true);

        Ok(())
    }

    pub async fn basic_publish(&self, exchange_name: &str, routing_key: &str, content: Content) -> Result<()> {
        self.call(Command::BasicPublish {
            exchange_name: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            content,
        })
        .await?;

        Ok(())
    }

    /// Start consuming a queue.
    ///
    /// It returns a `ConsumerHandler` with which the server events can be handled. The consumer is
    /// recorded, after a recovery it is registered again with the same tag and the messages keep
    /// coming through the same handler.
    ///
    /// ```no_run
    /// use metalmq_recovery::{Channel, ConsumerSignal, Exclusive, NoAck, NoLocal};
    ///
    /// async fn consume(channel: Channel) {
    ///     let mut handler = channel.basic_consume("queue", NoAck(false), Exclusive(false),
    ///         NoLocal(false)).await.unwrap();
    ///
    ///     while let Some(signal) = handler.signal_stream.recv().await {
    ///         match signal {
    ///             ConsumerSignal::Delivered(m) => {
    ///                 handler.basic_ack(m.delivery_tag).await.unwrap();
    ///             }
    ///             ConsumerSignal::Cancelled | ConsumerSignal::ChannelClosed { .. } |
    ///                 ConsumerSignal::ConnectionClosed { .. } => {
    ///                 break;
    ///             }
    ///         }
    ///     }
    /// }
    /// ```
    pub async fn basic_consume(
        &self,
        queue_name: &str,
        no_ack: NoAck,
        exclusive: Exclusive,
        no_local: NoLocal,
    ) -> Result<ConsumerHandler> {
        let consumer_tag = format!("metalmq-{}", rand::random::<u128>());

        let mut flags = ConsumeFlags::empty();
        flags.set(ConsumeFlags::NO_ACK, no_ack.0);
        flags.set(ConsumeFlags::EXCLUSIVE, exclusive.0);
        flags.set(ConsumeFlags::NO_LOCAL, no_local.0);

        // Buffer of the incoming, delivered messages or other signals like
        // consumer cancelled.
        let (sink, signal_stream) = mpsc::unbounded_channel::<ConsumerSignal>();

        let mut spec = ConsumerSpec {
            queue: queue_name.to_string(),
            consumer_tag,
            flags,
            arguments: FieldTable::new(),
            sink,
        };

        if let Reply::ConsumeStarted { consumer_tag } = self.call(Command::BasicConsume(spec.clone())).await? {
            spec.consumer_tag = consumer_tag;
        }

        let handler = ConsumerHandler::new(self.clone(), spec.consumer_tag.clone(), signal_stream);

        self.shared.ledger.record(self.channel, Entity::Consumer(spec));

        Ok(handler)
    }

    pub(crate) async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.call(Command::BasicAck { delivery_tag, multiple }).await?;

        Ok(())
    }

    pub(crate) async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let command = Command::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
        };

        self.shared
            .guard
            .guard(Identity::Consumer(consumer_tag.to_string()), self.call(command))
            .await?;

        Ok(())
    }

    /// Close the channel. Its consumers are cancelled and not recovered anymore, the exchanges,
    /// queues and bindings declared on it are still recovered.
    pub async fn close(self) -> Result<()> {
        let result = self.call(Command::ChannelClose).await;

        let reason = ClientError {
            channel: Some(self.channel),
            code: 200,
            message: "Channel closed by the application".to_string(),
            class_method: model::CHANNEL_CLOSE,
        };

        self.shared.drop_channel(self.channel, &reason);

        result?;

        Ok(())
    }
}
