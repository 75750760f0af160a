use anyhow::Result;
use metalmq_loopback::Broker;
use metalmq_recovery::config::{parse_config, ConnectionParams};
use metalmq_recovery::*;

#[tokio::main]
async fn main() -> Result<()> {
    metalmq_recovery::setup_logger(false);

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| concat!(env!("CARGO_MANIFEST_DIR"), "/recovery.toml").to_string());
    let config = parse_config(&path)?;
    let params = ConnectionParams::from_url(&config.connection.url)?;

    println!("Connecting as {} to {}{}", params.username, params.address(), params.virtual_host);
    println!("{:#?}", config.recovery);

    let broker = Broker::new();
    let conn = Connection::open(broker.connector_with_password(&params.password), config.recovery).await?;

    println!("{conn:?}");

    conn.close().await?;

    Ok(())
}
