//! Entities the application declares on the server and which the recovery engine needs to
//! recreate after a connection loss.
//!
//! Every entity carries all the data which is needed to issue the declare, bind or consume call
//! again, and has an [`Identity`] which decides if two declarations refer to the same thing.
use crate::consumer::ConsumerSink;
use crate::transport::Command;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Value of an argument or message header.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    LongString(String),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

/// Arguments of declarations and bindings. It is ordered, so two tables with the same content
/// compare and hash equally.
pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert String to ExchangeType
impl FromStr for ExchangeType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "fanout" => Ok(ExchangeType::Fanout),
            "headers" => Ok(ExchangeType::Headers),
            _ => Err(()),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExchangeFlags: u8 {
        const DURABLE = 0b0000_0001;
        const AUTO_DELETE = 0b0000_0010;
        const INTERNAL = 0b0000_0100;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u8 {
        const DURABLE = 0b0000_0001;
        const EXCLUSIVE = 0b0000_0010;
        const AUTO_DELETE = 0b0000_0100;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ConsumeFlags: u8 {
        const NO_ACK = 0b0000_0001;
        const EXCLUSIVE = 0b0000_0010;
        const NO_LOCAL = 0b0000_0100;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub flags: ExchangeFlags,
    pub arguments: FieldTable,
}

impl ExchangeSpec {
    pub fn new(name: &str, exchange_type: ExchangeType) -> Self {
        ExchangeSpec {
            name: name.to_string(),
            exchange_type,
            flags: ExchangeFlags::empty(),
            arguments: FieldTable::new(),
        }
    }

    pub fn flags(mut self, flags: ExchangeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_auto_delete(&self) -> bool {
        self.flags.contains(ExchangeFlags::AUTO_DELETE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub flags: QueueFlags,
    pub arguments: FieldTable,
    /// The name was generated by the server because the application declared the queue with an
    /// empty name. Such queues are not recovered.
    pub server_named: bool,
}

impl QueueSpec {
    pub fn new(name: &str) -> Self {
        QueueSpec {
            name: name.to_string(),
            flags: QueueFlags::empty(),
            arguments: FieldTable::new(),
            server_named: false,
        }
    }

    pub fn flags(mut self, flags: QueueFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_auto_delete(&self) -> bool {
        self.flags.contains(QueueFlags::AUTO_DELETE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindingKind {
    ExchangeToExchange,
    ExchangeToQueue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingSpec {
    pub kind: BindingKind,
    /// The source is always an exchange.
    pub source: String,
    /// Exchange or queue name depending on the `kind`.
    pub destination: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl BindingSpec {
    pub fn queue(queue: &str, exchange: &str, routing_key: &str) -> Self {
        BindingSpec {
            kind: BindingKind::ExchangeToQueue,
            source: exchange.to_string(),
            destination: queue.to_string(),
            routing_key: routing_key.to_string(),
            arguments: FieldTable::new(),
        }
    }

    pub fn exchange(destination: &str, source: &str, routing_key: &str) -> Self {
        BindingSpec {
            kind: BindingKind::ExchangeToExchange,
            source: source.to_string(),
            destination: destination.to_string(),
            routing_key: routing_key.to_string(),
            arguments: FieldTable::new(),
        }
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            kind: self.kind,
            source: self.source.clone(),
            destination: self.destination.clone(),
            routing_key: self.routing_key.clone(),
            arguments: self.arguments.clone(),
        }
    }

    pub fn binds_queue(&self, queue: &str) -> bool {
        self.kind == BindingKind::ExchangeToQueue && self.destination == queue
    }

    pub fn touches_exchange(&self, exchange: &str) -> bool {
        self.source == exchange || (self.kind == BindingKind::ExchangeToExchange && self.destination == exchange)
    }
}

/// Identity of a binding: two bindings are the same if all of these are the same.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub kind: BindingKind,
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// A consumer registration. The `sink` is the stable handle of the application's consumer, after a
/// recovery the messages keep arriving to the same sink.
#[derive(Clone, Debug)]
pub struct ConsumerSpec {
    pub queue: String,
    pub consumer_tag: String,
    pub flags: ConsumeFlags,
    pub arguments: FieldTable,
    pub sink: ConsumerSink,
}

impl ConsumerSpec {
    pub fn no_ack(&self) -> bool {
        self.flags.contains(ConsumeFlags::NO_ACK)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identity {
    Exchange(String),
    Queue(String),
    Binding(BindingKey),
    Consumer(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Exchange(name) => write!(f, "exchange '{name}'"),
            Identity::Queue(name) => write!(f, "queue '{name}'"),
            Identity::Binding(key) => write!(
                f,
                "binding '{}' -> '{}' with routing key '{}'",
                key.source, key.destination, key.routing_key
            ),
            Identity::Consumer(tag) => write!(f, "consumer '{tag}'"),
        }
    }
}

/// Replay tiers. Entities of a tier only depend on entities of earlier tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Exchanges,
    Queues,
    ExchangeBindings,
    QueueBindings,
    Consumers,
}

/// The order in which the recovery replays the topology, each tier is a barrier.
pub const REPLAY_ORDER: [Tier; 5] = [
    Tier::Exchanges,
    Tier::Queues,
    Tier::ExchangeBindings,
    Tier::QueueBindings,
    Tier::Consumers,
];

#[derive(Clone, Debug)]
pub enum Entity {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
    Consumer(ConsumerSpec),
}

impl Entity {
    pub fn identity(&self) -> Identity {
        match self {
            Entity::Exchange(e) => Identity::Exchange(e.name.clone()),
            Entity::Queue(q) => Identity::Queue(q.name.clone()),
            Entity::Binding(b) => Identity::Binding(b.key()),
            Entity::Consumer(c) => Identity::Consumer(c.consumer_tag.clone()),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Entity::Exchange(_) => Tier::Exchanges,
            Entity::Queue(_) => Tier::Queues,
            Entity::Binding(b) if b.kind == BindingKind::ExchangeToExchange => Tier::ExchangeBindings,
            Entity::Binding(_) => Tier::QueueBindings,
            Entity::Consumer(_) => Tier::Consumers,
        }
    }

    /// The command which declares the entity again. Declarations are never passive during replay,
    /// declaring an existing identical entity is a no-op on the server side.
    pub fn replay_command(&self) -> Command {
        match self {
            Entity::Exchange(e) => Command::ExchangeDeclare {
                exchange: e.clone(),
                passive: false,
            },
            Entity::Queue(q) => Command::QueueDeclare {
                queue: q.clone(),
                passive: false,
            },
            Entity::Binding(b) if b.kind == BindingKind::ExchangeToExchange => Command::ExchangeBind(b.clone()),
            Entity::Binding(b) => Command::QueueBind(b.clone()),
            Entity::Consumer(c) => Command::BasicConsume(c.clone()),
        }
    }

    /// The queue a binding or a consumer needs in order to be replayed.
    pub fn required_queue(&self) -> Option<&str> {
        match self {
            Entity::Binding(b) if b.kind == BindingKind::ExchangeToQueue => Some(&b.destination),
            Entity::Consumer(c) => Some(&c.queue),
            _ => None,
        }
    }
}
