//! The in-process broker.
//!
//! It keeps exchanges, queues, bindings and consumers the way an AMQP 0.9.1 server does, answers
//! with the same reply codes and can be told to fail: drop the connections, restart and lose the
//! non-durable entities, refuse logins or reject a given command.
use crate::routing;
use crate::session::LoopbackConnector;
use log::{debug, info, trace};
use metalmq_recovery::{
    model::{self, ChannelError, ChannelNumber, ClassMethod, ConnectionError},
    topology::{BindingKind, BindingSpec, ConsumeFlags, ConsumerSpec, ExchangeFlags, ExchangeSpec, QueueFlags, QueueSpec},
    transport::SignalSink,
    BrokerResult, ChannelSettings, ClientError, CloseReason, Command, Connector, ConsumerSignal, ConsumerSink, Content,
    DeliveredMessage, ExchangeType, FieldTable, Qos, QueueDeclareOk, Reply, TransportSignal,
};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A command the broker got, in the order of arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub session: String,
    pub channel: ChannelNumber,
    pub class_method: ClassMethod,
    pub target: String,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    content: Content,
    exchange: String,
    routing_key: String,
}

struct Queue {
    spec: QueueSpec,
    /// Session of the declaring connection of an exclusive queue.
    owner: Option<String>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
}

struct Consumer {
    queue: String,
    session: String,
    channel: ChannelNumber,
    exclusive: bool,
    sink: ConsumerSink,
}

struct SessionState {
    signals: SignalSink,
    channels: BTreeMap<ChannelNumber, ChannelSettings>,
}

fn channel_error(channel: ChannelNumber, code: ChannelError, text: String, cm: ClassMethod) -> ClientError {
    ClientError::channel(channel, code, &text, cm)
}

fn not_found(channel: ChannelNumber, what: &str, name: &str, cm: ClassMethod) -> ClientError {
    channel_error(
        channel,
        ChannelError::NotFound,
        format!("NOT_FOUND - no {what} '{name}' in vhost '/'"),
        cm,
    )
}

#[derive(Default)]
struct BrokerState {
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, Queue>,
    bindings: Vec<BindingSpec>,
    consumers: BTreeMap<String, Consumer>,
    sessions: BTreeMap<String, SessionState>,
    journal: Vec<JournalEntry>,
    connections_made: usize,
    password: String,
    refuse: usize,
    drop_on: Option<ClassMethod>,
    rejections: Vec<(ClassMethod, ClientError)>,
    delivery_tag: u64,
}

impl BrokerState {
    fn new() -> Self {
        let mut state = BrokerState {
            password: "guest".to_string(),
            ..Default::default()
        };

        for (name, exchange_type) in [
            ("amq.direct", ExchangeType::Direct),
            ("amq.fanout", ExchangeType::Fanout),
            ("amq.topic", ExchangeType::Topic),
            ("amq.headers", ExchangeType::Headers),
        ] {
            state.exchanges.insert(
                name.to_string(),
                ExchangeSpec::new(name, exchange_type).flags(ExchangeFlags::DURABLE),
            );
        }

        state
    }

    fn open_session(&mut self, password: &str, signals: SignalSink) -> BrokerResult<String> {
        if self.refuse > 0 {
            self.refuse -= 1;

            return Err(ClientError::connection_lost("Connection refused"));
        }

        if password != self.password {
            return Err(ClientError::connection(
                ConnectionError::AccessRefused,
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN",
                model::CONNECTION_OPEN,
            ));
        }

        self.connections_made += 1;

        let id = format!("loopback-{}", self.connections_made);

        self.sessions.insert(
            id.clone(),
            SessionState {
                signals,
                channels: BTreeMap::new(),
            },
        );

        info!("Session {id} is connected");

        Ok(id)
    }

    fn kill_session(&mut self, session: &str, reason: CloseReason) {
        let Some(state) = self.sessions.remove(session) else {
            return;
        };

        let tags = self
            .consumers
            .iter()
            .filter(|(_, c)| c.session == session)
            .map(|(tag, _)| tag.clone())
            .collect::<Vec<_>>();

        for tag in tags {
            self.remove_consumer(&tag);
        }

        let owned = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner.as_deref() == Some(session))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for queue in owned {
            self.delete_queue(&queue, false);
        }

        debug!("Session {session} is closed: {reason:?}");

        let _ = state.signals.send(TransportSignal::Closed {
            session_id: session.to_string(),
            reason,
        });
    }

    fn call(&mut self, session: &str, channel: ChannelNumber, command: Command) -> BrokerResult<Reply> {
        if !self.sessions.contains_key(session) {
            return Err(ClientError::connection_lost("Connection is closed"));
        }

        let class_method = command.class_method();

        self.journal.push(JournalEntry {
            session: session.to_string(),
            channel,
            class_method,
            target: command.target(),
        });

        if self.drop_on == Some(class_method) {
            self.drop_on = None;
            self.kill_session(
                session,
                CloseReason::Unexpected(ClientError::connection_lost("connection reset by peer")),
            );

            return Err(ClientError::connection_lost("connection reset by peer"));
        }

        let result = match self.rejections.iter().position(|(cm, _)| *cm == class_method) {
            Some(pos) => Err(self.rejections.remove(pos).1),
            None => self.handle(session, channel, command),
        };

        if let Err(e) = &result {
            trace!("Command {class_method:08X} on channel {channel} failed: {e}");

            if e.channel.is_some() {
                self.close_channel(session, channel);
            } else if e.is_retryable() {
                self.kill_session(session, CloseReason::Unexpected(e.clone()));
            }
        }

        result
    }

    fn handle(&mut self, session: &str, channel: ChannelNumber, command: Command) -> BrokerResult<Reply> {
        let class_method = command.class_method();

        match command {
            Command::ChannelOpen => self.channel_open(session, channel),
            _ if self.settings(session, channel).is_none() => Err(ClientError::connection(
                ConnectionError::ChannelError,
                "CHANNEL_ERROR - expected 'channel.open'",
                class_method,
            )),
            Command::ChannelClose => {
                self.close_channel(session, channel);

                Ok(Reply::Done)
            }
            Command::BasicQos { prefetch_count, global } => {
                self.update_settings(session, channel, |s| s.qos = Some(Qos { prefetch_count, global }));

                Ok(Reply::Done)
            }
            Command::ConfirmSelect => {
                if self.settings(session, channel).is_some_and(|s| s.transactional) {
                    return Err(channel_error(
                        channel,
                        ChannelError::PreconditionFailed,
                        "PRECONDITION_FAILED - cannot switch from tx to confirm mode".to_string(),
                        class_method,
                    ));
                }

                self.update_settings(session, channel, |s| s.confirm = true);

                Ok(Reply::Done)
            }
            Command::TxSelect => {
                if self.settings(session, channel).is_some_and(|s| s.confirm) {
                    return Err(channel_error(
                        channel,
                        ChannelError::PreconditionFailed,
                        "PRECONDITION_FAILED - cannot switch from confirm to tx mode".to_string(),
                        class_method,
                    ));
                }

                self.update_settings(session, channel, |s| s.transactional = true);

                Ok(Reply::Done)
            }
            Command::ExchangeDeclare { exchange, passive } => self.exchange_declare(channel, exchange, passive),
            Command::ExchangeDelete {
                exchange_name,
                if_unused,
            } => self.exchange_delete(channel, &exchange_name, if_unused),
            Command::ExchangeBind(binding) | Command::QueueBind(binding) => {
                self.bind(session, channel, binding, class_method)
            }
            Command::ExchangeUnbind(binding) | Command::QueueUnbind(binding) => {
                self.unbind(session, channel, binding, class_method)
            }
            Command::QueueDeclare { queue, passive } => self.queue_declare(session, channel, queue, passive),
            Command::QueueDelete {
                queue_name,
                if_unused,
                if_empty,
            } => self.queue_delete(session, channel, &queue_name, if_unused, if_empty),
            Command::BasicConsume(consumer) => self.basic_consume(session, channel, consumer),
            Command::BasicCancel { consumer_tag } => {
                if self.consumers.get(&consumer_tag).is_some_and(|c| c.session == session) {
                    self.remove_consumer(&consumer_tag);
                }

                Ok(Reply::Done)
            }
            Command::BasicPublish {
                exchange_name,
                routing_key,
                content,
            } => {
                self.publish(channel, &exchange_name, &routing_key, content)?;

                Ok(Reply::Done)
            }
            Command::BasicAck { .. } => Ok(Reply::Done),
        }
    }

    fn settings(&self, session: &str, channel: ChannelNumber) -> Option<ChannelSettings> {
        self.sessions.get(session)?.channels.get(&channel).copied()
    }

    fn update_settings<F>(&mut self, session: &str, channel: ChannelNumber, f: F)
    where
        F: FnOnce(&mut ChannelSettings),
    {
        if let Some(settings) = self.sessions.get_mut(session).and_then(|s| s.channels.get_mut(&channel)) {
            f(settings);
        }
    }

    fn channel_open(&mut self, session: &str, channel: ChannelNumber) -> BrokerResult<Reply> {
        let Some(state) = self.sessions.get_mut(session) else {
            return Err(ClientError::connection_lost("Connection is closed"));
        };

        if state.channels.contains_key(&channel) {
            return Err(ClientError::connection(
                ConnectionError::ChannelError,
                "CHANNEL_ERROR - second 'channel.open' seen",
                model::CHANNEL_OPEN,
            ));
        }

        state.channels.insert(channel, ChannelSettings::default());

        Ok(Reply::Done)
    }

    /// Close a channel and cancel its consumers.
    fn close_channel(&mut self, session: &str, channel: ChannelNumber) {
        if let Some(state) = self.sessions.get_mut(session) {
            state.channels.remove(&channel);
        }

        let tags = self
            .consumers
            .iter()
            .filter(|(_, c)| c.session == session && c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect::<Vec<_>>();

        for tag in tags {
            self.remove_consumer(&tag);
        }
    }

    fn exchange_declare(&mut self, channel: ChannelNumber, spec: ExchangeSpec, passive: bool) -> BrokerResult<Reply> {
        let cm = model::EXCHANGE_DECLARE;

        if passive {
            return match self.exchanges.contains_key(&spec.name) {
                true => Ok(Reply::Done),
                false => Err(not_found(channel, "exchange", &spec.name, cm)),
            };
        }

        if spec.name.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
                cm,
            ));
        }

        match self.exchanges.get(&spec.name) {
            Some(existing) if *existing == spec => Ok(Reply::Done),
            Some(_) => Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", spec.name),
                cm,
            )),
            None if spec.name.starts_with("amq.") => Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - exchange name '{}' contains reserved prefix 'amq.*'", spec.name),
                cm,
            )),
            None => {
                debug!("Exchange '{}' is declared", spec.name);

                self.exchanges.insert(spec.name.clone(), spec);

                Ok(Reply::Done)
            }
        }
    }

    fn exchange_delete(&mut self, channel: ChannelNumber, name: &str, if_unused: bool) -> BrokerResult<Reply> {
        let cm = model::EXCHANGE_DELETE;

        if name.is_empty() || name.starts_with("amq.") {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - operation not permitted on exchange '{name}'"),
                cm,
            ));
        }

        if !self.exchanges.contains_key(name) {
            return Err(not_found(channel, "exchange", name, cm));
        }

        if if_unused && self.bindings.iter().any(|b| b.source == name) {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - exchange '{name}' in use"),
                cm,
            ));
        }

        self.delete_exchange(name);

        Ok(Reply::Done)
    }

    fn delete_exchange(&mut self, name: &str) {
        debug!("Exchange '{name}' is deleted");

        self.exchanges.remove(name);
        self.bindings.retain(|b| !b.touches_exchange(name));
    }

    fn check_exclusive(&self, session: &str, channel: ChannelNumber, queue: &Queue, cm: ClassMethod) -> BrokerResult<()> {
        match &queue.owner {
            Some(owner) if owner != session => Err(channel_error(
                channel,
                ChannelError::ResourceLocked,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    queue.spec.name
                ),
                cm,
            )),
            _ => Ok(()),
        }
    }

    fn check_binding_endpoints(
        &self,
        session: &str,
        channel: ChannelNumber,
        binding: &BindingSpec,
        cm: ClassMethod,
    ) -> BrokerResult<()> {
        if binding.source.is_empty() || (binding.kind == BindingKind::ExchangeToExchange && binding.destination.is_empty())
        {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_string(),
                cm,
            ));
        }

        if !self.exchanges.contains_key(&binding.source) {
            return Err(not_found(channel, "exchange", &binding.source, cm));
        }

        match binding.kind {
            BindingKind::ExchangeToExchange => {
                if !self.exchanges.contains_key(&binding.destination) {
                    return Err(not_found(channel, "exchange", &binding.destination, cm));
                }
            }
            BindingKind::ExchangeToQueue => match self.queues.get(&binding.destination) {
                Some(queue) => self.check_exclusive(session, channel, queue, cm)?,
                None => return Err(not_found(channel, "queue", &binding.destination, cm)),
            },
        }

        Ok(())
    }

    fn bind(
        &mut self,
        session: &str,
        channel: ChannelNumber,
        binding: BindingSpec,
        cm: ClassMethod,
    ) -> BrokerResult<Reply> {
        self.check_binding_endpoints(session, channel, &binding, cm)?;

        if !self.bindings.contains(&binding) {
            trace!("Binding '{}' -> '{}' is added", binding.source, binding.destination);

            self.bindings.push(binding);
        }

        Ok(Reply::Done)
    }

    fn unbind(
        &mut self,
        session: &str,
        channel: ChannelNumber,
        binding: BindingSpec,
        cm: ClassMethod,
    ) -> BrokerResult<Reply> {
        self.check_binding_endpoints(session, channel, &binding, cm)?;

        self.bindings.retain(|b| *b != binding);

        let source = &binding.source;
        let auto_delete = self.exchanges.get(source).is_some_and(|x| x.is_auto_delete());

        if auto_delete && !self.bindings.iter().any(|b| &b.source == source) {
            self.delete_exchange(source);
        }

        Ok(Reply::Done)
    }

    fn queue_declare(
        &mut self,
        session: &str,
        channel: ChannelNumber,
        spec: QueueSpec,
        passive: bool,
    ) -> BrokerResult<Reply> {
        let cm = model::QUEUE_DECLARE;

        if passive {
            let queue = self
                .queues
                .get(&spec.name)
                .ok_or_else(|| not_found(channel, "queue", &spec.name, cm))?;

            self.check_exclusive(session, channel, queue, cm)?;

            return Ok(Reply::QueueDeclared(declare_ok(queue)));
        }

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            spec.name.clone()
        };

        if let Some(queue) = self.queues.get(&name) {
            self.check_exclusive(session, channel, queue, cm)?;

            if queue.spec.flags != spec.flags || queue.spec.arguments != spec.arguments {
                return Err(channel_error(
                    channel,
                    ChannelError::PreconditionFailed,
                    format!("PRECONDITION_FAILED - inequivalent arg for queue '{name}'"),
                    cm,
                ));
            }

            return Ok(Reply::QueueDeclared(declare_ok(queue)));
        }

        if !spec.name.is_empty() && spec.name.starts_with("amq.") {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - queue name '{name}' contains reserved prefix 'amq.*'"),
                cm,
            ));
        }

        debug!("Queue '{name}' is declared");

        let owner = spec
            .flags
            .contains(QueueFlags::EXCLUSIVE)
            .then(|| session.to_string());

        self.queues.insert(
            name.clone(),
            Queue {
                spec: QueueSpec { name: name.clone(), ..spec },
                owner,
                messages: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            },
        );

        Ok(Reply::QueueDeclared(QueueDeclareOk {
            queue_name: name,
            message_count: 0,
            consumer_count: 0,
        }))
    }

    fn queue_delete(
        &mut self,
        session: &str,
        channel: ChannelNumber,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> BrokerResult<Reply> {
        let cm = model::QUEUE_DELETE;
        let queue = self.queues.get(name).ok_or_else(|| not_found(channel, "queue", name, cm))?;

        self.check_exclusive(session, channel, queue, cm)?;

        if if_unused && !queue.consumers.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - queue '{name}' in use"),
                cm,
            ));
        }

        if if_empty && !queue.messages.is_empty() {
            return Err(channel_error(
                channel,
                ChannelError::PreconditionFailed,
                format!("PRECONDITION_FAILED - queue '{name}' not empty"),
                cm,
            ));
        }

        let message_count = queue.messages.len() as u32;

        self.delete_queue(name, false);

        Ok(Reply::QueueDeleted { message_count })
    }

    /// Delete a queue with its bindings and consumers. If `notify` is set, the consumers get a
    /// cancel signal.
    fn delete_queue(&mut self, name: &str, notify: bool) -> Option<Queue> {
        let queue = self.queues.remove(name)?;

        debug!("Queue '{name}' is deleted");

        self.bindings.retain(|b| !b.binds_queue(name));

        for tag in &queue.consumers {
            if let Some(consumer) = self.consumers.remove(tag) {
                if notify {
                    let _ = consumer.sink.send(ConsumerSignal::Cancelled);
                }
            }
        }

        Some(queue)
    }

    fn remove_consumer(&mut self, tag: &str) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };

        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            return;
        };

        queue.consumers.retain(|t| t != tag);

        if queue.spec.is_auto_delete() && queue.consumers.is_empty() {
            self.delete_queue(&consumer.queue, false);
        }
    }

    fn basic_consume(&mut self, session: &str, channel: ChannelNumber, spec: ConsumerSpec) -> BrokerResult<Reply> {
        let cm = model::BASIC_CONSUME;
        let queue = self
            .queues
            .get(&spec.queue)
            .ok_or_else(|| not_found(channel, "queue", &spec.queue, cm))?;

        self.check_exclusive(session, channel, queue, cm)?;

        // repeating a registration of the same connection changes nothing
        if let Some(existing) = self.consumers.get(&spec.consumer_tag) {
            if existing.session == session && existing.channel == channel && existing.queue == spec.queue {
                return Ok(Reply::ConsumeStarted {
                    consumer_tag: spec.consumer_tag,
                });
            }
        }

        let exclusive = spec.flags.contains(ConsumeFlags::EXCLUSIVE);
        let has_exclusive = queue
            .consumers
            .iter()
            .any(|tag| self.consumers.get(tag).is_some_and(|c| c.exclusive));

        if has_exclusive || (exclusive && !queue.consumers.is_empty()) {
            return Err(channel_error(
                channel,
                ChannelError::AccessRefused,
                format!("ACCESS_REFUSED - queue '{}' in exclusive use", spec.queue),
                cm,
            ));
        }

        let consumer_tag = if spec.consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            spec.consumer_tag.clone()
        };

        if self.consumers.contains_key(&consumer_tag) {
            return Err(ClientError::connection(
                ConnectionError::NotAllowed,
                "NOT_ALLOWED - attempt to reuse consumer tag",
                cm,
            ));
        }

        self.consumers.insert(
            consumer_tag.clone(),
            Consumer {
                queue: spec.queue.clone(),
                session: session.to_string(),
                channel,
                exclusive,
                sink: spec.sink,
            },
        );

        if let Some(queue) = self.queues.get_mut(&spec.queue) {
            queue.consumers.push(consumer_tag.clone());
        }

        self.dispatch(&spec.queue);

        Ok(Reply::ConsumeStarted { consumer_tag })
    }

    /// Route a message to queues and deliver it to the consumers. It returns the number of queues
    /// the message went to.
    fn publish(&mut self, channel: ChannelNumber, exchange: &str, routing_key: &str, content: Content) -> BrokerResult<usize> {
        let queues = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| BTreeSet::from([routing_key.to_string()]))
                .unwrap_or_default()
        } else {
            if !self.exchanges.contains_key(exchange) {
                return Err(not_found(channel, "exchange", exchange, model::BASIC_PUBLISH));
            }

            self.route(exchange, routing_key, &content.headers)
        };

        for name in &queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(StoredMessage {
                    content: content.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
        }

        for name in &queues {
            self.dispatch(name);
        }

        Ok(queues.len())
    }

    /// Find the queues a message goes to, following the exchange-to-exchange bindings.
    fn route(&self, exchange: &str, routing_key: &str, headers: &FieldTable) -> BTreeSet<String> {
        let mut visited = HashSet::new();
        let mut pending = vec![exchange.to_string()];
        let mut queues = BTreeSet::new();

        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            let Some(spec) = self.exchanges.get(&name) else {
                continue;
            };

            for binding in self.bindings.iter().filter(|b| b.source == name) {
                if routing::binding_matches(spec.exchange_type, binding, routing_key, headers) {
                    match binding.kind {
                        BindingKind::ExchangeToQueue => {
                            queues.insert(binding.destination.clone());
                        }
                        BindingKind::ExchangeToExchange => pending.push(binding.destination.clone()),
                    }
                }
            }
        }

        queues
    }

    /// Deliver the messages of a queue to its consumers in round-robin.
    fn dispatch(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };

            if queue.consumers.is_empty() || queue.messages.is_empty() {
                return;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            let tag = queue.consumers[idx].clone();
            let Some(consumer) = self.consumers.get(&tag) else {
                queue.consumers.remove(idx);
                continue;
            };

            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            self.delivery_tag += 1;

            let delivered = DeliveredMessage {
                content: message.content.clone(),
                consumer_tag: tag.clone(),
                delivery_tag: self.delivery_tag,
                redelivered: false,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
            };

            if consumer.sink.send(ConsumerSignal::Delivered(Box::new(delivered))).is_err() {
                // the consumer handler is dropped
                queue.messages.push_front(message);
                queue.consumers.remove(idx);
                self.consumers.remove(&tag);
            }
        }
    }

    fn restart(&mut self) {
        info!("Broker is restarting");

        let sessions = self.sessions.keys().cloned().collect::<Vec<_>>();

        for session in sessions {
            self.kill_session(
                &session,
                CloseReason::Unexpected(ClientError::connection(
                    ConnectionError::ConnectionForced,
                    "CONNECTION_FORCED - broker forced connection closure with reason 'shutdown'",
                    model::CONNECTION_CLOSE,
                )),
            );
        }

        self.exchanges
            .retain(|name, x| name.starts_with("amq.") || x.flags.contains(ExchangeFlags::DURABLE));
        self.queues.retain(|_, q| q.spec.flags.contains(QueueFlags::DURABLE));

        for queue in self.queues.values_mut() {
            queue.messages.retain(|m| m.content.delivery_mode == Some(2));
            queue.consumers.clear();
        }

        let exchanges = &self.exchanges;
        let queues = &self.queues;

        self.bindings.retain(|b| {
            exchanges.contains_key(&b.source)
                && match b.kind {
                    BindingKind::ExchangeToExchange => exchanges.contains_key(&b.destination),
                    BindingKind::ExchangeToQueue => queues.contains_key(&b.destination),
                }
        });
    }
}

fn declare_ok(queue: &Queue) -> QueueDeclareOk {
    QueueDeclareOk {
        queue_name: queue.spec.name.clone(),
        message_count: queue.messages.len() as u32,
        consumer_count: queue.consumers.len() as u32,
    }
}

/// Handle of the in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for Broker {
    fn default() -> Self {
        Broker {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector logging in with the default password.
    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector_with_password("guest")
    }

    pub fn connector_with_password(&self, password: &str) -> Arc<dyn Connector> {
        Arc::new(LoopbackConnector::new(self.clone(), password))
    }

    pub(crate) fn open_session(&self, password: &str, signals: SignalSink) -> BrokerResult<String> {
        self.lock().open_session(password, signals)
    }

    pub(crate) fn call(&self, session: &str, channel: ChannelNumber, command: Command) -> BrokerResult<Reply> {
        self.lock().call(session, channel, command)
    }

    pub(crate) fn close_session(&self, session: &str) {
        self.lock().kill_session(session, CloseReason::Application);
    }

    /// Drop every connection as if the network failed.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let sessions = state.sessions.keys().cloned().collect::<Vec<_>>();

        for session in sessions {
            state.kill_session(
                &session,
                CloseReason::Unexpected(ClientError::connection_lost("connection reset by peer")),
            );
        }
    }

    /// Drop every connection and forget the non-durable exchanges and queues, the messages which
    /// are not persistent and the bindings whose endpoints are gone.
    pub fn restart(&self) {
        self.lock().restart();
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refuse = count;
    }

    pub fn set_password(&self, password: &str) {
        self.lock().password = password.to_string();
    }

    /// Drop the connection when the next command of the class method arrives, before executing it.
    pub fn drop_connection_on(&self, class_method: ClassMethod) {
        self.lock().drop_on = Some(class_method);
    }

    /// Answer the next command of the class method with an error.
    pub fn reject_next(&self, class_method: ClassMethod, err: ClientError) {
        self.lock().rejections.push((class_method, err));
    }

    /// Publish a message as another client would do.
    pub fn publish(&self, exchange: &str, routing_key: &str, content: Content) -> BrokerResult<usize> {
        self.lock().publish(0, exchange, routing_key, content)
    }

    /// Take the first message of a queue.
    pub fn get(&self, queue: &str) -> Option<Content> {
        self.lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
            .map(|m| m.content)
    }

    /// Delete an exchange as another client would do.
    pub fn delete_exchange(&self, name: &str) {
        self.lock().delete_exchange(name);
    }

    /// Delete a queue as another client would do, its consumers are cancelled.
    pub fn delete_queue(&self, name: &str) {
        self.lock().delete_queue(name, true);
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn has_binding(&self, binding: &BindingSpec) -> bool {
        self.lock().bindings.contains(binding)
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.lock().bindings.clone()
    }

    /// Settings of a channel on the most recent live connection.
    pub fn channel_settings(&self, channel: ChannelNumber) -> Option<ChannelSettings> {
        self.lock()
            .sessions
            .values()
            .rev()
            .find_map(|s| s.channels.get(&channel).copied())
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn connections_made(&self) -> usize {
        self.lock().connections_made
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}
