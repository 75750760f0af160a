use super::helper;
use anyhow::Result;
use metalmq_loopback::Broker;
use metalmq_recovery::{
    model::LocalError, BackoffConfig, Connection, ExchangeDeclareOpts, ExchangeType, GateMode, RecoveryConfig,
    StateEvent,
};
use std::time::Duration;
use tokio::sync::broadcast;

fn slow_recovery(gate: GateMode) -> RecoveryConfig {
    RecoveryConfig {
        gate,
        backoff: BackoffConfig {
            initial_interval_ms: 100,
            max_interval_ms: 100,
            multiplier: 1.0,
            jitter: 0.0,
        },
        ..helper::config()
    }
}

/// Drop the connection and make the first two reconnects fail, so the connection stays
/// recovering for about 200 ms.
async fn start_slow_recovery(broker: &Broker, conn: &Connection) -> broadcast::Receiver<StateEvent> {
    let mut events = conn.subscribe();

    broker.refuse_connections(2);
    broker.drop_connections();

    helper::wait_for(&mut events, |e| *e == StateEvent::Recovering { attempt: 1 }).await;

    events
}

#[tokio::test]
async fn queued_operation_runs_after_recovery() -> Result<()> {
    let broker = Broker::new();
    let conn = helper::connect_with(&broker, slow_recovery(GateMode::Queue { capacity: 8 })).await?;
    let ch = conn.channel_open(1).await?;

    let mut events = start_slow_recovery(&broker, &conn).await;

    let declare = tokio::spawn({
        let ch = ch.clone();

        async move {
            ch.exchange_declare("x-queued", ExchangeType::Direct, ExchangeDeclareOpts::default())
                .await
        }
    });

    helper::wait_for(&mut events, |e| *e == StateEvent::Connected).await;

    declare.await??;

    assert!(broker.exchange_exists("x-queued"));
    assert_eq!(conn.topology().len(), 1);

    Ok(())
}

#[tokio::test]
async fn fail_fast_gate_rejects_during_recovery() -> Result<()> {
    let broker = Broker::new();
    let conn = helper::connect_with(&broker, slow_recovery(GateMode::FailFast)).await?;
    let ch = conn.channel_open(1).await?;

    let mut events = start_slow_recovery(&broker, &conn).await;

    let result = ch
        .exchange_declare("x-rejected", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await;

    let err = helper::to_client_error(result);
    assert_eq!(err.code, LocalError::Recovering as u16);

    helper::wait_for(&mut events, |e| *e == StateEvent::Connected).await;

    assert!(!broker.exchange_exists("x-rejected"));
    assert!(conn.topology().is_empty());

    Ok(())
}

#[tokio::test]
async fn full_queue_gate_rejects() -> Result<()> {
    let broker = Broker::new();
    let conn = helper::connect_with(&broker, slow_recovery(GateMode::Queue { capacity: 1 })).await?;
    let ch = conn.channel_open(1).await?;

    let mut events = start_slow_recovery(&broker, &conn).await;

    let waiting = tokio::spawn({
        let ch = ch.clone();

        async move {
            ch.exchange_declare("x-waiting", ExchangeType::Fanout, ExchangeDeclareOpts::default())
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = ch
        .exchange_declare("x-overflow", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await;

    let err = helper::to_client_error(result);
    assert_eq!(err.code, LocalError::QueueFull as u16);

    helper::wait_for(&mut events, |e| *e == StateEvent::Connected).await;
    waiting.await??;

    assert!(broker.exchange_exists("x-waiting"));
    assert!(!broker.exchange_exists("x-overflow"));

    Ok(())
}
