//! The boundary between the recovery engine and the transport.
//!
//! The transport owns the socket, the codec and the heartbeats. It hands out a [`Session`] for
//! every physical connection it establishes and reports the closing of that connection as a
//! [`TransportSignal`]. The engine talks to the server only by sending [`Command`]s over the
//! session.
use crate::{
    error::ClientError,
    message::Content,
    model::{self, ChannelNumber, ClassMethod, LocalError},
    topology::{BindingSpec, ConsumerSpec, ExchangeSpec, QueueSpec},
};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub type BrokerResult<T> = std::result::Result<T, ClientError>;

/// Identifier of one physical connection.
pub type SessionId = String;

/// Channel for the transport to report the connection state changes.
pub type SignalSink = mpsc::UnboundedSender<TransportSignal>;

#[derive(Clone, Debug)]
pub enum Command {
    ChannelOpen,
    ChannelClose,
    BasicQos { prefetch_count: u16, global: bool },
    ConfirmSelect,
    TxSelect,
    ExchangeDeclare { exchange: ExchangeSpec, passive: bool },
    ExchangeDelete { exchange_name: String, if_unused: bool },
    ExchangeBind(BindingSpec),
    ExchangeUnbind(BindingSpec),
    QueueDeclare { queue: QueueSpec, passive: bool },
    QueueBind(BindingSpec),
    QueueUnbind(BindingSpec),
    QueueDelete { queue_name: String, if_unused: bool, if_empty: bool },
    BasicConsume(ConsumerSpec),
    BasicCancel { consumer_tag: String },
    BasicPublish { exchange_name: String, routing_key: String, content: Content },
    BasicAck { delivery_tag: u64, multiple: bool },
}

impl Command {
    pub fn class_method(&self) -> ClassMethod {
        match self {
            Command::ChannelOpen => model::CHANNEL_OPEN,
            Command::ChannelClose => model::CHANNEL_CLOSE,
            Command::BasicQos { .. } => model::BASIC_QOS,
            Command::ConfirmSelect => model::CONFIRM_SELECT,
            Command::TxSelect => model::TX_SELECT,
            Command::ExchangeDeclare { .. } => model::EXCHANGE_DECLARE,
            Command::ExchangeDelete { .. } => model::EXCHANGE_DELETE,
            Command::ExchangeBind(_) => model::EXCHANGE_BIND,
            Command::ExchangeUnbind(_) => model::EXCHANGE_UNBIND,
            Command::QueueDeclare { .. } => model::QUEUE_DECLARE,
            Command::QueueBind(_) => model::QUEUE_BIND,
            Command::QueueUnbind(_) => model::QUEUE_UNBIND,
            Command::QueueDelete { .. } => model::QUEUE_DELETE,
            Command::BasicConsume(_) => model::BASIC_CONSUME,
            Command::BasicCancel { .. } => model::BASIC_CANCEL,
            Command::BasicPublish { .. } => model::BASIC_PUBLISH,
            Command::BasicAck { .. } => model::BASIC_ACK,
        }
    }

    /// Name of the entity the command works on, for logging and journaling.
    pub fn target(&self) -> String {
        match self {
            Command::ExchangeDeclare { exchange, .. } => exchange.name.clone(),
            Command::ExchangeDelete { exchange_name, .. } => exchange_name.clone(),
            Command::QueueDeclare { queue, .. } => queue.name.clone(),
            Command::QueueDelete { queue_name, .. } => queue_name.clone(),
            Command::ExchangeBind(b) | Command::ExchangeUnbind(b) | Command::QueueBind(b) | Command::QueueUnbind(b) => {
                format!("{}->{}", b.source, b.destination)
            }
            Command::BasicConsume(c) => c.queue.clone(),
            Command::BasicCancel { consumer_tag } => consumer_tag.clone(),
            Command::BasicPublish { exchange_name, .. } => exchange_name.clone(),
            _ => String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue_name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    QueueDeclared(QueueDeclareOk),
    QueueDeleted { message_count: u32 },
    ConsumeStarted { consumer_tag: String },
}

/// Why a physical connection was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The application closed the connection, this never triggers recovery.
    Application,
    /// Network error, server shutdown, forced close and the like.
    Unexpected(ClientError),
}

#[derive(Debug)]
pub enum TransportSignal {
    Closed { session_id: SessionId, reason: CloseReason },
}

/// One physical connection to the server.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Send a command on a channel and wait for the reply of the server.
    fn call(&self, channel: ChannelNumber, command: Command) -> BoxFuture<'_, BrokerResult<Reply>>;

    /// Close the connection gracefully.
    fn close(&self) -> BoxFuture<'_, BrokerResult<()>>;
}

/// Establishes physical connections. The successful result of `connect` is the
/// "connection established" signal, the closing of the session is reported on `signals`.
pub trait Connector: Send + Sync {
    fn connect(&self, signals: SignalSink) -> BoxFuture<'_, BrokerResult<Arc<dyn Session>>>;
}

/// Holds the current physical connection. It is replaced on every successful reconnect.
pub(crate) struct SessionSlot {
    current: RwLock<Arc<dyn Session>>,
}

impl SessionSlot {
    pub(crate) fn new(session: Arc<dyn Session>) -> Self {
        SessionSlot {
            current: RwLock::new(session),
        }
    }

    pub(crate) fn current(&self) -> Arc<dyn Session> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn replace(&self, session: Arc<dyn Session>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub(crate) fn is_current(&self, session_id: &str) -> bool {
        self.current().id() == session_id
    }
}

/// Await a transport operation, turning the elapsed timeout into a retryable error.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> BrokerResult<T>
where
    F: Future<Output = BrokerResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::local(
            LocalError::Timeout,
            &format!("{what} timed out after {} ms", timeout.as_millis()),
        )),
    }
}

pub(crate) async fn call(
    session: &dyn Session,
    channel: ChannelNumber,
    command: Command,
    timeout: Duration,
) -> BrokerResult<Reply> {
    let class_method = command.class_method();

    with_timeout(timeout, "Command", session.call(channel, command))
        .await
        .map_err(|mut e| {
            if e.class_method == 0 {
                e.class_method = class_method;
            }
            e
        })
}
