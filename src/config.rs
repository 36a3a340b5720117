use crate::deposit::DepositSettings;
use crate::guard::RetryPolicy;
use crate::payout::HttpPayoutConfig;
use crate::service::LedgerSettings;
use crate::withdrawal::WithdrawalSettings;
use anyhow::{bail, Context};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Which implementation backs an external integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMode {
    Sandbox,
    Http,
}

const DEFAULT_PROVIDER_URL: &str = "https://api.razorpay.com/v1";

/// Resolve `key` (`sandbox` or `http`). Unset means http when credentials
/// are present; the sandbox is only implied for the memory store.
fn integration_mode(
    key: &str,
    explicit: Option<&str>,
    credentials_present: bool,
    store: StoreKind,
) -> anyhow::Result<IntegrationMode> {
    match explicit {
        Some("sandbox") => Ok(IntegrationMode::Sandbox),
        Some("http") if credentials_present => Ok(IntegrationMode::Http),
        Some("http") => bail!("{}=http requires its credentials to be set", key),
        Some(other) => bail!("{} must be sandbox or http, got {:?}", key, other),
        None if credentials_present => Ok(IntegrationMode::Http),
        None if store == StoreKind::Memory => Ok(IntegrationMode::Sandbox),
        None => bail!(
            "{} credentials are missing; set them or {}=sandbox explicitly",
            key,
            key
        ),
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    pub payout_events_topic: String,
    pub group_id: String,
}

/// Service configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreKind,
    pub database_url: String,
    pub db_max_connections: u32,
    pub port: u16,
    pub currency: String,
    pub min_deposit: Decimal,
    pub max_deposit: Decimal,
    pub min_withdrawal: Decimal,
    pub deposit_intent_ttl: Duration,
    pub gateway: IntegrationMode,
    pub gateway_api_url: String,
    pub gateway_key_id: String,
    pub gateway_key_secret: String,
    pub payout_rail: IntegrationMode,
    pub payout_api_url: String,
    pub payout_key_id: String,
    pub payout_key_secret: String,
    pub payout_source_account: String,
    pub payout_webhook_secret: String,
    pub guard_max_attempts: u32,
    pub guard_backoff: Duration,
    /// None when `KAFKA_BROKERS` is unset
    pub kafka: Option<KafkaConfig>,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store = match var("LEDGER_STORE").as_deref() {
            None | Some("postgres") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => bail!("LEDGER_STORE must be postgres or memory, got {:?}", other),
        };

        let database_url = match (store, var("DATABASE_URL")) {
            (_, Some(url)) => url,
            (StoreKind::Memory, None) => String::new(),
            (StoreKind::Postgres, None) => bail!("DATABASE_URL is required for the postgres store"),
        };

        let min_deposit = parse_or("MIN_DEPOSIT", Decimal::from(100))?;
        let max_deposit = parse_or("MAX_DEPOSIT", Decimal::from(100_000))?;
        if min_deposit > max_deposit {
            bail!("MIN_DEPOSIT ({}) exceeds MAX_DEPOSIT ({})", min_deposit, max_deposit);
        }

        let guard_max_attempts = parse_or("GUARD_MAX_ATTEMPTS", 5u32)?;
        if guard_max_attempts == 0 {
            bail!("GUARD_MAX_ATTEMPTS must be at least 1");
        }

        let gateway_key_id = var("GATEWAY_KEY_ID").unwrap_or_default();
        let gateway_key_secret = var("GATEWAY_KEY_SECRET").unwrap_or_default();
        let gateway = integration_mode(
            "GATEWAY",
            var("GATEWAY").as_deref(),
            !gateway_key_id.is_empty() && !gateway_key_secret.is_empty(),
            store,
        )?;

        let payout_key_id = var("PAYOUT_KEY_ID").unwrap_or_else(|| gateway_key_id.clone());
        let payout_key_secret =
            var("PAYOUT_KEY_SECRET").unwrap_or_else(|| gateway_key_secret.clone());
        let payout_source_account = var("PAYOUT_SOURCE_ACCOUNT").unwrap_or_default();
        let payout_rail = integration_mode(
            "PAYOUT_RAIL",
            var("PAYOUT_RAIL").as_deref(),
            !payout_key_id.is_empty()
                && !payout_key_secret.is_empty()
                && !payout_source_account.is_empty(),
            store,
        )?;

        let kafka = match var("KAFKA_BROKERS") {
            Some(brokers) => Some(KafkaConfig {
                brokers,
                topic: var("KAFKA_TOPIC").unwrap_or_else(|| "ledger-events".to_string()),
                payout_events_topic: var("PAYOUT_EVENTS_TOPIC")
                    .unwrap_or_else(|| "payout-events".to_string()),
                group_id: var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|| "ledger-service-group".to_string()),
            }),
            None => None,
        };

        Ok(Self {
            store,
            database_url,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 10)?,
            port: parse_or("PORT", 3000)?,
            currency: var("CURRENCY").unwrap_or_else(|| "INR".to_string()),
            min_deposit,
            max_deposit,
            min_withdrawal: parse_or("MIN_WITHDRAWAL", Decimal::from(100))?,
            deposit_intent_ttl: Duration::from_secs(parse_or("DEPOSIT_INTENT_TTL_SECS", 900)?),
            gateway,
            gateway_api_url: var("GATEWAY_API_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            gateway_key_id,
            gateway_key_secret,
            payout_rail,
            payout_api_url: var("PAYOUT_API_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            payout_key_id,
            payout_key_secret,
            payout_source_account,
            payout_webhook_secret: var("PAYOUT_WEBHOOK_SECRET").unwrap_or_default(),
            guard_max_attempts,
            guard_backoff: Duration::from_millis(parse_or("GUARD_BACKOFF_MS", 10)?),
            kafka,
        })
    }

    pub fn payout_config(&self) -> HttpPayoutConfig {
        HttpPayoutConfig {
            base_url: self.payout_api_url.clone(),
            key_id: self.payout_key_id.clone(),
            key_secret: self.payout_key_secret.clone(),
            source_account: self.payout_source_account.clone(),
            currency: self.currency.clone(),
        }
    }

    pub fn ledger_settings(&self) -> anyhow::Result<LedgerSettings> {
        let intent_ttl = chrono::Duration::from_std(self.deposit_intent_ttl)
            .context("DEPOSIT_INTENT_TTL_SECS out of range")?;
        Ok(LedgerSettings {
            retry: RetryPolicy {
                max_attempts: self.guard_max_attempts,
                base_backoff: self.guard_backoff,
            },
            deposit: DepositSettings {
                minimum: self.min_deposit,
                maximum: self.max_deposit,
                intent_ttl,
                currency: self.currency.clone(),
                gateway_secret: self.gateway_key_secret.clone(),
            },
            withdrawal: WithdrawalSettings {
                minimum: self.min_withdrawal,
                webhook_secret: self.payout_webhook_secret.clone(),
            },
        })
    }
}
