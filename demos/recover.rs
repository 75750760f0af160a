use anyhow::Result;
use log::info;
use metalmq_loopback::Broker;
use metalmq_recovery::*;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    let exchange = "x-prices";
    let queue = "q-prices";

    metalmq_recovery::setup_logger(false);

    let broker = Broker::new();
    let conn = Connection::open(broker.connector(), RecoveryConfig::default()).await?;

    let mut events = conn.events();
    tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            info!("State event {event:?}");
        }
    });

    let channel = conn.channel_open(1).await?;

    channel
        .exchange_declare(exchange, ExchangeType::Topic, ExchangeDeclareOpts::default())
        .await?;
    channel.queue_declare(queue, QueueDeclareOpts::default()).await?;
    channel
        .queue_bind(queue, exchange, Binding::Topic("price.#".to_string()))
        .await?;

    let mut handler = channel
        .basic_consume(queue, NoAck(false), Exclusive(false), NoLocal(false))
        .await?;

    for round in 0..3 {
        let mut states = conn.subscribe();

        // the broker forgets everything which is not durable
        broker.restart();

        while states.recv().await? != StateEvent::Connected {}

        channel
            .basic_publish(exchange, "price.nyse", Content::default().text(&format!("round {round}")))
            .await?;

        if let Some(ConsumerSignal::Delivered(msg)) = handler.receive(Duration::from_secs(1)).await {
            println!("Received '{}' after {} connections", msg.content.body_text(), broker.connections_made());

            handler.basic_ack(msg.delivery_tag).await?;
        }
    }

    handler.basic_cancel().await?;
    channel.close().await?;
    conn.close().await?;

    Ok(())
}
