use super::helper;
use anyhow::Result;
use metalmq_loopback::Broker;
use metalmq_recovery::{
    model,
    topology::{BindingSpec, Identity},
    Binding, Content, ExchangeDeclareOpts, ExchangeType, Exclusive, IfEmpty, IfUnused, NoAck, NoLocal,
    QueueDeclareOpts, StateEvent,
};

#[tokio::test]
async fn unbound_exchange_binding_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-a", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.exchange_declare("x-b", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.exchange_bind("x-b", "x-a", Binding::Fanout).await?;
    ch.queue_declare("q-e2e", QueueDeclareOpts::default()).await?;
    ch.queue_bind("q-e2e", "x-b", Binding::Fanout).await?;
    ch.exchange_unbind("x-b", "x-a", Binding::Fanout).await?;

    helper::restart_and_recover(&broker, &conn).await;

    ch.basic_publish("x-a", "", Content::default().text("lost")).await?;
    assert_eq!(broker.message_count("q-e2e"), Some(0));

    ch.basic_publish("x-b", "", Content::default().text("routed")).await?;
    assert_eq!(broker.message_count("q-e2e"), Some(1));

    Ok(())
}

#[tokio::test]
async fn deleted_exchange_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-deleted", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await?;
    ch.exchange_delete("x-deleted", IfUnused(false)).await?;

    helper::restart_and_recover(&broker, &conn).await;

    let result = ch
        .exchange_declare(
            "x-deleted",
            ExchangeType::Direct,
            ExchangeDeclareOpts::default().passive(true),
        )
        .await;

    let err = helper::to_client_error(result);
    assert_eq!(err.code, 404);
    assert_eq!(err.channel, Some(1));
    assert_eq!(err.class_method, model::EXCHANGE_DECLARE);

    Ok(())
}

#[tokio::test]
async fn deleted_queue_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("q-deleted", QueueDeclareOpts::default()).await?;
    ch.queue_delete("q-deleted", IfUnused(false), IfEmpty(false)).await?;

    helper::restart_and_recover(&broker, &conn).await;

    let result = ch
        .queue_declare("q-deleted", QueueDeclareOpts::default().passive(true))
        .await;

    let err = helper::to_client_error(result);
    assert_eq!(err.code, 404);
    assert_eq!(err.class_method, model::QUEUE_DECLARE);

    Ok(())
}

#[tokio::test]
async fn unbound_queue_binding_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-direct", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-unbound", QueueDeclareOpts::default()).await?;
    ch.queue_bind("q-unbound", "x-direct", Binding::Direct("rk".to_string()))
        .await?;
    ch.queue_unbind("q-unbound", "x-direct", Binding::Direct("rk".to_string()))
        .await?;

    helper::restart_and_recover(&broker, &conn).await;

    assert!(broker.queue_exists("q-unbound"));
    assert!(!broker.has_binding(&BindingSpec::queue("q-unbound", "x-direct", "rk")));

    ch.basic_publish("x-direct", "rk", Content::default()).await?;
    assert_eq!(broker.message_count("q-unbound"), Some(0));

    Ok(())
}

#[tokio::test]
async fn deleted_exchange_takes_its_bindings() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-gone", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-stays", QueueDeclareOpts::default()).await?;
    ch.queue_bind("q-stays", "x-gone", Binding::Fanout).await?;
    ch.exchange_delete("x-gone", IfUnused(false)).await?;

    helper::restart_and_recover(&broker, &conn).await;

    assert!(broker.queue_exists("q-stays"));
    assert!(!broker.exchange_exists("x-gone"));
    assert!(broker.bindings().is_empty());

    Ok(())
}

#[tokio::test]
async fn delete_lost_with_the_connection_is_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let mut events = conn.subscribe();

    ch.queue_declare("q-race", QueueDeclareOpts::default()).await?;

    broker.drop_connection_on(model::QUEUE_DELETE);

    let result = ch.queue_delete("q-race", IfUnused(false), IfEmpty(false)).await;
    assert!(result.is_err());

    helper::wait_for(&mut events, |e| *e == StateEvent::Connected).await;

    assert!(broker.queue_exists("q-race"));
    assert!(conn
        .topology()
        .iter()
        .any(|e| e.identity() == Identity::Queue("q-race".to_string())));

    Ok(())
}

#[tokio::test]
async fn refused_delete_keeps_the_queue() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;
    let ch2 = conn.channel_open(2).await?;

    ch.queue_declare("q-busy", QueueDeclareOpts::default()).await?;
    let _handler = ch.basic_consume("q-busy", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    let err = helper::to_client_error(ch2.queue_delete("q-busy", IfUnused(true), IfEmpty(false)).await);
    assert_eq!(err.code, 406);

    helper::restart_and_recover(&broker, &conn).await;

    assert!(broker.queue_exists("q-busy"));
    assert_eq!(broker.consumer_count("q-busy"), Some(1));

    Ok(())
}

#[tokio::test]
async fn cancelled_consumer_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("q-cancel", QueueDeclareOpts::default()).await?;
    let handler = ch.basic_consume("q-cancel", NoAck(true), Exclusive(false), NoLocal(false)).await?;
    handler.basic_cancel().await?;

    helper::restart_and_recover(&broker, &conn).await;

    assert_eq!(broker.consumer_count("q-cancel"), Some(0));

    Ok(())
}

#[tokio::test]
async fn auto_deleted_queue_is_forgotten() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("q-auto", QueueDeclareOpts::default().auto_delete(true))
        .await?;
    let handler = ch.basic_consume("q-auto", NoAck(true), Exclusive(false), NoLocal(false)).await?;
    handler.basic_cancel().await?;

    assert!(!broker.queue_exists("q-auto"));
    assert!(conn.topology().is_empty());

    helper::restart_and_recover(&broker, &conn).await;

    assert!(!broker.queue_exists("q-auto"));

    Ok(())
}
