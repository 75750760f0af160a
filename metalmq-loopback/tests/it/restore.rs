use super::helper;
use anyhow::Result;
use metalmq_loopback::Broker;
use metalmq_recovery::{
    model, Binding, Content, ExchangeDeclareOpts, ExchangeType, Exclusive, FieldTable, FieldValue, HeaderMatch, NoAck,
    NoLocal, QueueDeclareOpts,
};
use std::time::Duration;

#[tokio::test]
async fn topology_is_restored_after_restart() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("prices", ExchangeType::Topic, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("nyse", QueueDeclareOpts::default()).await?;
    ch.queue_bind("nyse", "prices", Binding::Topic("price.nyse.*".to_string()))
        .await?;

    let mut handler = ch.basic_consume("nyse", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    helper::restart_and_recover(&broker, &conn).await;

    assert!(broker.exchange_exists("prices"));
    assert!(broker.queue_exists("nyse"));
    assert_eq!(broker.consumer_count("nyse"), Some(1));
    assert_eq!(broker.connections_made(), 2);

    broker.publish("prices", "price.nyse.ibm", Content::default().text("142.5"))?;

    let msg = helper::unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await);
    assert_eq!(msg.content.body_text(), "142.5");
    assert_eq!(msg.consumer_tag, handler.consumer_tag);
    assert_eq!(msg.routing_key, "price.nyse.ibm");

    Ok(())
}

#[tokio::test]
async fn replay_follows_dependency_order() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("q-order", QueueDeclareOpts::default()).await?;
    ch.exchange_declare("x-b", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.exchange_declare("x-a", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_bind("q-order", "x-a", Binding::Fanout).await?;
    ch.exchange_bind("x-b", "x-a", Binding::Fanout).await?;
    let _handler = ch.basic_consume("q-order", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    broker.clear_journal();

    helper::restart_and_recover(&broker, &conn).await;

    let replayed = broker
        .journal()
        .into_iter()
        .filter(|e| e.session == "loopback-2")
        .map(|e| (e.class_method, e.target))
        .collect::<Vec<_>>();

    assert_eq!(
        replayed,
        vec![
            (model::CHANNEL_OPEN, String::new()),
            (model::EXCHANGE_DECLARE, "x-b".to_string()),
            (model::EXCHANGE_DECLARE, "x-a".to_string()),
            (model::QUEUE_DECLARE, "q-order".to_string()),
            (model::EXCHANGE_BIND, "x-a->x-b".to_string()),
            (model::QUEUE_BIND, "x-a->q-order".to_string()),
            (model::BASIC_CONSUME, "q-order".to_string()),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn replay_on_correct_broker_changes_nothing() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-idem", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-idem", QueueDeclareOpts::default().durable(true))
        .await?;
    ch.queue_bind("q-idem", "x-idem", Binding::Direct("idem".to_string()))
        .await?;
    let _handler = ch.basic_consume("q-idem", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    let bindings = broker.bindings();

    for _ in 0..2 {
        let report = conn.replay_topology().await?;

        assert_eq!(report.replayed, 4);
        assert!(report.absent.is_empty());
    }

    assert_eq!(broker.bindings(), bindings);
    assert_eq!(broker.consumer_count("q-idem"), Some(1));
    assert_eq!(broker.connections_made(), 1);

    Ok(())
}

#[tokio::test]
async fn lost_entities_come_back_with_manual_replay() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-admin", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-admin", QueueDeclareOpts::default()).await?;
    ch.queue_bind("q-admin", "x-admin", Binding::Fanout).await?;

    broker.delete_queue("q-admin");

    conn.replay_topology().await?;

    assert!(broker.queue_exists("q-admin"));
    assert_eq!(broker.publish("x-admin", "", Content::default())?, 1);

    Ok(())
}

#[tokio::test]
async fn exclusive_queue_is_declared_on_the_new_connection() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("q-exclusive", QueueDeclareOpts::default().exclusive(true))
        .await?;

    helper::drop_and_recover(&broker, &conn).await;

    assert!(broker.queue_exists("q-exclusive"));

    // the new connection owns it
    ch.queue_declare("q-exclusive", QueueDeclareOpts::default().passive(true))
        .await?;

    Ok(())
}

#[tokio::test]
async fn server_named_queue_is_not_recovered() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-events", ExchangeType::Fanout, ExchangeDeclareOpts::default())
        .await?;

    let ok = ch.queue_declare("", QueueDeclareOpts::default().exclusive(true)).await?;
    assert!(ok.queue_name.starts_with("amq.gen-"));

    ch.queue_bind(&ok.queue_name, "x-events", Binding::Fanout).await?;

    let mut handler = ch
        .basic_consume(&ok.queue_name, NoAck(true), Exclusive(false), NoLocal(false))
        .await?;

    helper::drop_and_recover(&broker, &conn).await;

    assert!(!broker.queue_exists(&ok.queue_name));
    assert!(broker.exchange_exists("x-events"));
    assert_eq!(conn.topology().len(), 1);
    assert!(matches!(
        handler.receive(Duration::from_secs(1)).await,
        Some(metalmq_recovery::ConsumerSignal::Cancelled)
    ));

    Ok(())
}

#[tokio::test]
async fn headers_binding_is_restored() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    let mut headers = FieldTable::new();
    headers.insert("region".to_string(), "eu".into());

    ch.exchange_declare("x-headers", ExchangeType::Headers, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-eu", QueueDeclareOpts::default()).await?;
    ch.queue_bind(
        "q-eu",
        "x-headers",
        Binding::Headers {
            headers,
            x_match: HeaderMatch::All,
        },
    )
    .await?;

    helper::restart_and_recover(&broker, &conn).await;

    let eu = Content::default().header("region", FieldValue::from("eu"));
    let us = Content::default().header("region", FieldValue::from("us"));

    assert_eq!(broker.publish("x-headers", "", eu)?, 1);
    assert_eq!(broker.publish("x-headers", "", us)?, 0);

    Ok(())
}

#[tokio::test]
async fn consumers_survive_a_missing_queue_on_their_channel() -> Result<()> {
    let broker = Broker::new();

    let (other, other_ch) = helper::connect_channel(&broker).await?;
    other_ch.queue_declare("ext", QueueDeclareOpts::default()).await?;
    other.close().await?;

    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.queue_declare("mine", QueueDeclareOpts::default().durable(true))
        .await?;
    let _mine = ch.basic_consume("mine", NoAck(true), Exclusive(false), NoLocal(false)).await?;
    let mut ext = ch.basic_consume("ext", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    // the non-durable queue of the other connection is lost
    helper::restart_and_recover(&broker, &conn).await;

    assert!(!broker.queue_exists("ext"));
    assert_eq!(broker.consumer_count("mine"), Some(1));
    assert_eq!(conn.topology().len(), 2);
    assert!(matches!(
        ext.receive(Duration::from_secs(1)).await,
        Some(metalmq_recovery::ConsumerSignal::Cancelled)
    ));

    ch.queue_declare("mine", QueueDeclareOpts::default().durable(true))
        .await?;

    Ok(())
}

#[tokio::test]
async fn manual_replay_is_not_interleaved_with_channel_calls() -> Result<()> {
    let broker = Broker::new();
    let (conn, ch) = helper::connect_channel(&broker).await?;

    ch.exchange_declare("x-serial", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await?;
    ch.queue_declare("q-serial", QueueDeclareOpts::default()).await?;
    ch.queue_bind("q-serial", "x-serial", Binding::Direct("serial".to_string()))
        .await?;
    let _handler = ch.basic_consume("q-serial", NoAck(true), Exclusive(false), NoLocal(false)).await?;

    broker.clear_journal();

    let (report, declared) = tokio::join!(
        conn.replay_topology(),
        ch.exchange_declare("x-app", ExchangeType::Direct, ExchangeDeclareOpts::default())
    );
    report?;
    declared?;

    let targets = broker
        .journal()
        .into_iter()
        .filter(|e| e.channel == 1)
        .map(|e| e.target)
        .collect::<Vec<_>>();
    assert_eq!(targets.len(), 5);

    let app = targets.iter().position(|t| t == "x-app");
    assert!(app == Some(0) || app == Some(4), "{targets:?}");

    Ok(())
}
