use std::{sync::Arc, time::Duration};

use courier::{
    config::Config,
    service::Service,
    storage::sqlite::SqliteStorage,
    subscriber::SubscriberRegistry,
    transport::memory::InMemoryBroker,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    #[serde(rename = "orderId")]
    order_id: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::init_tracing()?;

    let config = Config::load()?;
    let storage = SqliteStorage::connect(&config).await?;
    let broker = InMemoryBroker::new();

    let registry = SubscriberRegistry::builder()
        .subscribe("order.created", None, |order: OrderCreated, ctx| async move {
            tracing::info!(order_id = order.order_id, message_id = %ctx.message_id, "Order received");
            Ok(())
        })
        .build();

    let service = Service::launch()
        .config(config)
        .storage(storage)
        .transport(Arc::new(broker.clone()))
        .consumer_factory(Arc::new(broker))
        .registry(registry)
        .start()
        .await?;

    let publisher = service.publisher().clone();
    let producer = tokio::spawn(async move {
        for order_id in 1.. {
            if let Err(e) = publisher
                .publish("order.created", &OrderCreated { order_id })
                .await
            {
                tracing::error!(error = %e, "Publish failed");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    producer.abort();
    service.shutdown().await;

    Ok(())
}
