use crate::broker::Broker;
use futures::future::BoxFuture;
use metalmq_recovery::{
    transport::{SessionId, SignalSink},
    BrokerResult, ChannelNumber, Command, Connector, Reply, Session,
};
use std::sync::Arc;

/// Connects to the in-process [`Broker`] with a password.
pub struct LoopbackConnector {
    broker: Broker,
    password: String,
}

impl LoopbackConnector {
    pub fn new(broker: Broker, password: &str) -> Self {
        LoopbackConnector {
            broker,
            password: password.to_string(),
        }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, signals: SignalSink) -> BoxFuture<'_, BrokerResult<Arc<dyn Session>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;

            let id = self.broker.open_session(&self.password, signals)?;

            Ok(Arc::new(LoopbackSession {
                id,
                broker: self.broker.clone(),
            }) as Arc<dyn Session>)
        })
    }
}

struct LoopbackSession {
    id: SessionId,
    broker: Broker,
}

impl Session for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn call(&self, channel: ChannelNumber, command: Command) -> BoxFuture<'_, BrokerResult<Reply>> {
        Box::pin(async move {
            // let the other tasks interleave as on a real socket
            tokio::task::yield_now().await;

            self.broker.call(&self.id, channel, command)
        })
    }

    fn close(&self) -> BoxFuture<'_, BrokerResult<()>> {
        Box::pin(async move {
            self.broker.close_session(&self.id);

            Ok(())
        })
    }
}
