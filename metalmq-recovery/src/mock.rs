//! Scripted transport for the unit tests. It answers every command with success unless a failure
//! is scripted for it, and keeps a journal of the commands it got.
use crate::{
    error::ClientError,
    model::{ChannelNumber, ClassMethod},
    transport::{BrokerResult, CloseReason, Command, Connector, QueueDeclareOk, Reply, Session, SignalSink, TransportSignal},
};
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) session: String,
    pub(crate) channel: ChannelNumber,
    pub(crate) class_method: ClassMethod,
    pub(crate) target: String,
}

#[derive(Default)]
struct MockState {
    sessions: usize,
    journal: Vec<Call>,
    dropped: HashSet<String>,
    signals: Option<(String, SignalSink)>,
    connect_failures: VecDeque<ClientError>,
    /// Failures of commands, the first one with matching class method is used.
    call_failures: Vec<(ClassMethod, Option<ChannelNumber>, ClientError)>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { broker: self.clone() })
    }

    pub(crate) fn fail_connect(&self, err: ClientError) {
        self.state.lock().unwrap().connect_failures.push_back(err);
    }

    pub(crate) fn fail_call(&self, class_method: ClassMethod, channel: Option<ChannelNumber>, err: ClientError) {
        self.state.lock().unwrap().call_failures.push((class_method, channel, err));
    }

    /// Drop the current session as if the network failed.
    pub(crate) fn drop_connection(&self) {
        let mut state = self.state.lock().unwrap();

        if let Some((session_id, sink)) = state.signals.clone() {
            state.dropped.insert(session_id.clone());

            let _ = sink.send(TransportSignal::Closed {
                session_id,
                reason: CloseReason::Unexpected(ClientError::connection_lost("connection reset by peer")),
            });
        }
    }

    /// Report the close of an arbitrary session, even a replaced one.
    pub(crate) fn signal_closed(&self, session_id: &str) {
        let state = self.state.lock().unwrap();

        if let Some((_, sink)) = &state.signals {
            let _ = sink.send(TransportSignal::Closed {
                session_id: session_id.to_string(),
                reason: CloseReason::Unexpected(ClientError::connection_lost("connection reset by peer")),
            });
        }
    }

    pub(crate) fn sessions(&self) -> usize {
        self.state.lock().unwrap().sessions
    }

    pub(crate) fn journal(&self) -> Vec<Call> {
        self.state.lock().unwrap().journal.clone()
    }

    pub(crate) fn clear_journal(&self) {
        self.state.lock().unwrap().journal.clear();
    }

    /// Calls of a session with the given class method.
    pub(crate) fn calls(&self, session: usize, class_method: ClassMethod) -> Vec<Call> {
        let session = format!("session-{session}");

        self.journal()
            .into_iter()
            .filter(|c| c.session == session && c.class_method == class_method)
            .collect()
    }
}

struct MockConnector {
    broker: MockBroker,
}

impl Connector for MockConnector {
    fn connect(&self, signals: SignalSink) -> BoxFuture<'_, BrokerResult<Arc<dyn Session>>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();

            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }

            state.sessions += 1;

            let id = format!("session-{}", state.sessions);
            state.signals = Some((id.clone(), signals));

            Ok(Arc::new(MockSession {
                id,
                broker: self.broker.clone(),
            }) as Arc<dyn Session>)
        })
    }
}

struct MockSession {
    id: String,
    broker: MockBroker,
}

impl Session for MockSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn call(&self, channel: ChannelNumber, command: Command) -> BoxFuture<'_, BrokerResult<Reply>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            let class_method = command.class_method();

            if state.dropped.contains(&self.id) {
                return Err(ClientError::connection_lost("connection is closed"));
            }

            state.journal.push(Call {
                session: self.id.clone(),
                channel,
                class_method,
                target: command.target(),
            });

            let failure = state
                .call_failures
                .iter()
                .position(|(cm, ch, _)| *cm == class_method && ch.map_or(true, |ch| ch == channel));

            if let Some(pos) = failure {
                let (_, _, err) = state.call_failures.remove(pos);

                return Err(err);
            }

            Ok(match command {
                Command::QueueDeclare { queue, .. } => {
                    let queue_name = if queue.name.is_empty() {
                        format!("amq.gen-{}", state.journal.len())
                    } else {
                        queue.name
                    };

                    Reply::QueueDeclared(QueueDeclareOk {
                        queue_name,
                        ..Default::default()
                    })
                }
                Command::QueueDelete { .. } => Reply::QueueDeleted { message_count: 0 },
                Command::BasicConsume(consumer) => Reply::ConsumeStarted {
                    consumer_tag: consumer.consumer_tag,
                },
                _ => Reply::Done,
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, BrokerResult<()>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();

            state.dropped.insert(self.id.clone());

            if let Some((session_id, sink)) = state.signals.clone() {
                if session_id == self.id {
                    let _ = sink.send(TransportSignal::Closed {
                        session_id,
                        reason: CloseReason::Application,
                    });
                }
            }

            Ok(())
        })
    }
}
