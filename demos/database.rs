use std::{sync::Arc, time::Duration};

use outbox_broker::{
    Broker, BrokerForwarder, ConsumerConfig, DeliveryMeta, Event, EventRouter, OutboxBus,
    PoolConfig, Relay, RelayConfig, Validate, Validator, Violations,
    outbox::sqlx::PgOutbox,
    transport::{ExchangeKind, InMemory},
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, postgres::PgConnectOptions};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Serialize, Deserialize)]
struct UserCreated {
    user_id: String,
}

impl Event for UserCreated {
    const NAME: &'static str = "user.created";

    fn tags(&self) -> &[&'static str] {
        &["profile"]
    }
}

impl Validate for UserCreated {
    fn validate(&self, violations: &mut Violations) {
        violations.required("user_id", &self.user_id);
    }
}

async fn welcome(event: UserCreated, meta: DeliveryMeta) -> Result<(), BoxError> {
    tracing::info!(user_id = %event.user_id, routing_key = %meta.routing_key, "Welcome");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Connection settings come from the PG* environment variables
    let pool = PgPool::connect_with(PgConnectOptions::new()).await?;
    let outbox = PgOutbox::try_new(pool).await?;
    let bus = OutboxBus::new(outbox.clone());

    let mut router = EventRouter::new(Validator::new());
    router.route(welcome);

    let mut broker = Broker::new(Some(Arc::new(InMemory::default())), PoolConfig::default());
    broker.declare_exchange("events", ExchangeKind::Topic).await?;
    broker.add_raw_consumer(
        ConsumerConfig::new("users").with_binding("events", "user.*"),
        router.handler(),
        &[],
    );
    let broker = Arc::new(broker);

    let cancel = CancellationToken::new();
    let consumers = tokio::spawn({
        let broker = broker.clone();
        let cancel = cancel.clone();
        async move { broker.run(cancel).await }
    });

    let relay = Relay::new(outbox.clone(), BrokerForwarder::new(broker.clone()))
        .with_config(RelayConfig::default().with_poll_interval(Duration::from_millis(500)));
    let relaying = tokio::spawn({
        let cancel = cancel.clone();
        async move { relay.run(cancel).await }
    });

    let writer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut n = 0;
            while !cancel.is_cancelled() {
                let user_id = format!("u-{n}");
                let written = outbox
                    .run_in_transaction(|tx| {
                        let bus = bus.clone();
                        Box::pin(async move {
                            let id = bus.publish(&UserCreated { user_id }, tx).await?;
                            Ok::<_, BoxError>(id)
                        })
                    })
                    .await;
                if let Err(error) = written {
                    tracing::error!(%error, "Failed to write event");
                }
                n += 1;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    cancel.cancel();

    writer.await?;
    relaying.await?;
    consumers.await??;
    broker.shutdown().await;
    Ok(())
}
