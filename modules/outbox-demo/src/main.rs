use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use outbox_dispatch::{Dispatcher, HandlerRegistry};
use outbox_store::{migrate, NewEvent, OutboxConfig, OutboxStore};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: i32,
    amount: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("outbox=info".parse()?)
                .add_directive("order_relay=info".parse()?),
        )
        .init();

    info!("Order relay starting...");

    let config = OutboxConfig::from_env()?;
    config.log_redacted();

    let store = OutboxStore::connect(&config).await?;

    // Idempotent
    migrate(store.pool()).await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS orders (
            id SERIAL PRIMARY KEY,
            amount BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(store.pool())
    .await?;

    let registry = HandlerRegistry::new()
        .on("order.created", |event, ctx| async move {
            let order: OrderCreated = event.decode()?;
            let outcome = ctx
                .run_once(async {
                    info!(
                        order_id = order.order_id,
                        amount = order.amount,
                        "Sending order confirmation"
                    );
                    anyhow::Ok(())
                })
                .await?;
            if !outcome.executed() {
                info!(order_id = order.order_id, "Confirmation already sent");
            }
            anyhow::Ok(())
        })
        .expect("order.created");

    let relay = Dispatcher::postgres(store.clone(), registry)
        .with_name("order-relay")
        .start()?;

    let amount: i64 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<i64>())
        .transpose()?
        .unwrap_or(100);

    // The order row and its event commit together or not at all.
    let order_id = store
        .with_transaction(move |tx| {
            Box::pin(async move {
                let (order_id,): (i32,) =
                    sqlx::query_as("INSERT INTO orders (amount) VALUES ($1) RETURNING id")
                        .bind(amount)
                        .fetch_one(tx.conn())
                        .await?;
                tx.enqueue(NewEvent::json(
                    "order.created",
                    &OrderCreated { order_id, amount },
                )?)
                .await?;
                Ok::<_, anyhow::Error>(order_id)
            })
        })
        .await?;
    info!(order_id, amount, "Order placed");

    info!("Relaying outbox events, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let stats = relay.stop().await?;
    info!("Order relay stopped. {stats}");
    Ok(())
}
