//! Automatic connection and topology recovery for AMQP 0.9 clients.
//!
//! A [`Connection`] records every exchange, queue, binding and consumer which is declared through
//! its channels. When the transport reports an unexpected close, the connection reconnects with
//! backoff, reopens its channels and declares the recorded topology again. Entities deleted by the
//! application are forgotten once the server confirmed the delete, so they never come back.
//!
//! The wire protocol is not part of this crate, a transport plugs in by implementing
//! [`Connector`] and [`Session`].
mod backoff;
pub use backoff::Backoff;

mod channel;
pub use channel::{ChannelFailure, ChannelSettings, Qos};

mod channel_api;
pub use channel_api::{
    AutoDelete, Binding, Channel, Durable, Exclusive, ExchangeDeclareOpts, HeaderMatch, IfEmpty, IfUnused, Internal,
    NoAck, NoLocal, QueueDeclareOpts,
};

pub mod config;
pub use config::{BackoffConfig, GateMode, RecoveryConfig};

mod connection;
pub use connection::Connection;

mod consumer;
pub use consumer::{ConsumerHandler, ConsumerSignal, ConsumerSink};

mod dev;
pub use dev::setup_logger;

mod error;
pub use error::{ClientError, Outcome};

mod guard;
pub use guard::DeletionGuard;

mod ledger;
pub use ledger::{LedgerEntry, Snapshot, TopologyLedger};

mod message;
pub use message::{Content, DeliveredMessage};

pub mod model;
pub use model::ChannelNumber;

mod orchestrator;
pub use orchestrator::ReplayReport;

mod state;
pub use state::{ConnectionState, StateEvent};

pub mod topology;
pub use topology::{ExchangeType, FieldTable, FieldValue};

pub mod transport;
pub use transport::{BrokerResult, CloseReason, Command, Connector, QueueDeclareOk, Reply, Session, TransportSignal};

#[cfg(test)]
mod mock;
