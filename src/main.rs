use ledger_service::config::{Config, IntegrationMode, StoreKind};
use ledger_service::consumer::PayoutEventConsumer;
use ledger_service::gateway::{HttpGateway, PaymentGateway, SandboxGateway};
use ledger_service::handlers::{self, AppState};
use ledger_service::kafka::{EventPublisher, KafkaProducer, LogPublisher};
use ledger_service::payout::{HttpPayoutRail, PayoutRail, SandboxPayoutRail};
use ledger_service::service::Ledger;
use ledger_service::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    tracing::info!("Starting Ledger Service");
    tracing::info!("Store: {:?}", config.store);
    tracing::info!("Currency: {}", config.currency);

    let store: Arc<dyn LedgerStore> = match config.store {
        StoreKind::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(&config.database_url)
                .await?;

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Migrations completed successfully");

            Arc::new(PgLedgerStore::new(pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory ledger store; balances are lost on restart");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let publisher: Arc<dyn EventPublisher> = match &config.kafka {
        Some(kafka) => {
            tracing::info!(
                brokers = %kafka.brokers,
                topic = %kafka.topic,
                "Initializing Kafka producer..."
            );
            Arc::new(KafkaProducer::new(&kafka.brokers, kafka.topic.clone())?)
        }
        None => {
            tracing::info!("KAFKA_BROKERS not set, ledger events are only logged");
            Arc::new(LogPublisher)
        }
    };

    if config.gateway_key_secret.is_empty() {
        tracing::warn!("GATEWAY_KEY_SECRET not set, deposit verification will always fail");
    }

    let gateway: Arc<dyn PaymentGateway> = match config.gateway {
        IntegrationMode::Http => {
            tracing::info!(url = %config.gateway_api_url, "Using HTTP payment gateway");
            Arc::new(HttpGateway::new(
                config.gateway_api_url.clone(),
                config.gateway_key_id.clone(),
                config.gateway_key_secret.clone(),
            )?)
        }
        IntegrationMode::Sandbox => {
            tracing::warn!("Using sandbox payment gateway; no real orders are created");
            Arc::new(SandboxGateway::new(config.gateway_key_id.clone()))
        }
    };

    let rail: Arc<dyn PayoutRail> = match config.payout_rail {
        IntegrationMode::Http => {
            tracing::info!(url = %config.payout_api_url, "Using HTTP payout rail");
            Arc::new(HttpPayoutRail::new(config.payout_config())?)
        }
        IntegrationMode::Sandbox => {
            tracing::warn!("Using sandbox payout rail; payouts wait for a callback");
            Arc::new(SandboxPayoutRail)
        }
    };

    let ledger = Arc::new(Ledger::new(
        store,
        gateway,
        rail,
        publisher,
        config.ledger_settings()?,
    ));

    if let Some(kafka) = &config.kafka {
        let consumer = PayoutEventConsumer::new(
            &kafka.brokers,
            &kafka.group_id,
            &kafka.payout_events_topic,
            ledger.clone(),
        )?;
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                tracing::error!(error = %e, "Payout event consumer stopped");
            }
        });
        tracing::info!(topic = %kafka.payout_events_topic, "Payout event consumer started");
    }

    let app = handlers::router(AppState { ledger })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Ledger Service listening on {}", addr);
    tracing::info!("  POST   /wallets                          - Open wallet");
    tracing::info!("  GET    /wallets/:wallet_id               - Get wallet");
    tracing::info!("  POST   /wallets/:wallet_id/deposits      - Initiate deposit");
    tracing::info!("  POST   /deposits/verify                  - Verify deposit");
    tracing::info!("  POST   /wallets/:wallet_id/withdrawals   - Request withdrawal");
    tracing::info!("  POST   /payouts/callback                 - Payout status webhook");
    tracing::info!("  GET    /wallets/:wallet_id/transactions  - Transaction history");
    tracing::info!("  POST   /wallets/:wallet_id/trades        - Settle trade");

    axum::serve(listener, app).await?;

    Ok(())
}
