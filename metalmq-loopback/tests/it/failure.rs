use super::helper;
use anyhow::Result;
use metalmq_loopback::Broker;
use metalmq_recovery::{
    model::{self, ChannelError, ConnectionError, LocalError},
    ClientError, ConnectionState, ConsumerSignal, Exclusive, NoAck, NoLocal, QueueDeclareOpts, RecoveryConfig,
    StateEvent,
};
use std::time::Duration;

#[tokio::test]
async fn first_connect_failure_is_returned() {
    let broker = Broker::new();

    broker.set_password("secret");

    let err = helper::to_client_error(helper::connect(&broker).await);

    assert_eq!(err.code, ConnectionError::AccessRefused as u16);
    assert_eq!(err.class_method, model::CONNECTION_OPEN);
}

#[tokio::test]
async fn refused_connections_are_retried() -> Result<()> {
    let broker = Broker::new();
    let (conn, _ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    broker.refuse_connections(3);
    broker.drop_connections();

    let mut attempts = vec![];

    loop {
        match helper::wait_for(&mut events, |_| true).await {
            StateEvent::Recovering { attempt } => attempts.push(attempt),
            StateEvent::Connected => break,
            _ => {}
        }
    }

    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(broker.connections_made(), 2);

    Ok(())
}

#[tokio::test]
async fn changed_credentials_stop_recovery() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    ch.queue_declare("q-auth", QueueDeclareOpts::default()).await?;
    let mut handler = ch.basic_consume("q-auth", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    broker.set_password("rotated");
    broker.drop_connections();

    let event = helper::wait_for(&mut events, |e| matches!(e, StateEvent::RecoveryFailed { .. })).await;

    assert!(matches!(
        event,
        StateEvent::RecoveryFailed { cause } if cause.code == ConnectionError::AccessRefused as u16
    ));
    assert_eq!(conn.state(), ConnectionState::RecoveryFailed);
    assert_eq!(broker.connections_made(), 1);

    assert!(matches!(
        handler.receive(Duration::from_secs(1)).await,
        Some(ConsumerSignal::ConnectionClosed { reply_code: 403, .. })
    ));

    let err = helper::to_client_error(ch.queue_declare("q-auth", QueueDeclareOpts::default()).await);
    assert_eq!(err.code, LocalError::RecoveryFailed as u16);

    Ok(())
}

#[tokio::test]
async fn retry_budget_is_respected() -> Result<()> {
    let broker = Broker::new();
    let conn = helper::connect_with(
        &broker,
        RecoveryConfig {
            max_attempts: Some(3),
            ..helper::config()
        },
    )
    .await?;
    let mut events = conn.subscribe();

    broker.refuse_connections(10);
    broker.drop_connections();

    helper::wait_for(&mut events, |e| matches!(e, StateEvent::RecoveryFailed { .. })).await;

    let failure = conn.failure().unwrap();
    assert_eq!(failure.code, LocalError::RecoveryFailed as u16);
    assert!(failure.message.contains("3 attempts"));
    assert_eq!(broker.connections_made(), 1);

    Ok(())
}

#[tokio::test]
async fn inequivalent_declaration_during_replay_is_fatal() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    ch.queue_declare("q-conflict", QueueDeclareOpts::default()).await?;

    broker.reject_next(
        model::QUEUE_DECLARE,
        ClientError::channel(
            1,
            ChannelError::PreconditionFailed,
            "PRECONDITION_FAILED - inequivalent arg 'durable' for queue 'q-conflict'",
            model::QUEUE_DECLARE,
        ),
    );
    broker.restart();

    let event = helper::wait_for(&mut events, |e| {
        matches!(e, StateEvent::RecoveryFailed { .. } | StateEvent::Connected)
    })
    .await;

    assert!(matches!(event, StateEvent::RecoveryFailed { cause } if cause.code == 406));
    assert_eq!(broker.connections_made(), 2);

    Ok(())
}

#[tokio::test]
async fn forced_close_during_replay_is_retried() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    ch.queue_declare("q-forced", QueueDeclareOpts::default()).await?;

    broker.drop_connection_on(model::QUEUE_DECLARE);
    broker.restart();

    helper::wait_for(&mut events, |e| *e == StateEvent::Connected).await;

    assert!(broker.queue_exists("q-forced"));
    assert_eq!(broker.connections_made(), 3);

    Ok(())
}

#[tokio::test]
async fn graceful_close_does_not_recover() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    ch.queue_declare("q-close", QueueDeclareOpts::default()).await?;
    let mut handler = ch.basic_consume("q-close", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    conn.close().await?;

    assert_eq!(helper::wait_for(&mut events, |_| true).await, StateEvent::Closed);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        handler.receive(Duration::from_secs(1)).await,
        Some(ConsumerSignal::ConnectionClosed { reply_code: 200, .. })
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.connections_made(), 1);
    assert_eq!(broker.live_sessions(), 0);

    let err = helper::to_client_error(ch.queue_declare("q-close", QueueDeclareOpts::default()).await);
    assert_eq!(err.code, LocalError::Closed as u16);

    Ok(())
}

#[tokio::test]
async fn disabled_recovery_leaves_connection_down() -> Result<()> {
    let broker = Broker::new();
    let conn = helper::connect_with(
        &broker,
        RecoveryConfig {
            automatic_recovery: false,
            ..helper::config()
        },
    )
    .await?;
    let mut events = conn.subscribe();
    let ch = conn.channel_open(1).await?;

    broker.drop_connections();

    helper::wait_for(&mut events, |e| matches!(e, StateEvent::Disconnected { .. })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(broker.connections_made(), 1);

    let err = helper::to_client_error(ch.queue_declare("q", QueueDeclareOpts::default()).await);
    assert_eq!(err.code, LocalError::ConnectionLost as u16);

    Ok(())
}
