//! An in-process AMQP broker for exercising connection recovery.
//!
//! The [`Broker`] behaves like an AMQP 0.9.1 server as far as the topology is concerned and can
//! be told to drop connections, restart or refuse logins. Connect to it with
//! [`Broker::connector`] and hand the connector to
//! [`Connection::open`](metalmq_recovery::Connection::open).
mod broker;
pub use broker::{Broker, JournalEntry};

pub mod routing;

mod session;
pub use session::LoopbackConnector;
