use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tollgate::billing::config::{self, Env, GatewaySettings, StripeSettings};
use tollgate::billing::usage::init_usage_schema;
use tollgate::{AdminGateway, BillingHttpState, HttpAdminGateway, Ledger, UsagePool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut args = std::env::args().skip(1);

    let mut listen = "0.0.0.0:4001".to_string();
    let mut json_logs = false;
    let mut free_tier: Option<Decimal> = None;
    let mut dedup_charges = false;
    let mut signup_models: Vec<String> = Vec::new();
    let mut key_duration: Option<String> = None;
    let mut otel_enabled = false;
    let mut otel_endpoint: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--free-tier" => {
                let raw = args.next().ok_or("missing value for --free-tier")?;
                free_tier = Some(Decimal::from_str(raw.trim()).map_err(|_| "invalid --free-tier")?);
            }
            "--dedup-charges" => {
                dedup_charges = true;
            }
            "--model" => {
                signup_models.push(args.next().ok_or("missing value for --model")?);
            }
            "--key-duration" => {
                key_duration = Some(args.next().ok_or("missing value for --key-duration")?);
            }
            "--otel" => {
                otel_enabled = true;
            }
            "--otel-endpoint" => {
                otel_enabled = true;
                otel_endpoint = Some(args.next().ok_or("missing value for --otel-endpoint")?);
            }
            other => {
                return Err(format!(
                    "unknown arg: {other}\nusage: tollgate-billingd [--listen HOST:PORT] \
                     [--json-logs] [--free-tier USD] [--dedup-charges] [--model NAME]... \
                     [--key-duration WINDOW] [--otel] [--otel-endpoint URL]"
                )
                .into());
            }
        }
    }

    let _otel_guard = if otel_enabled {
        attach_otel(otel_endpoint.as_deref(), json_logs)?
    } else {
        init_fmt_tracing(json_logs)?;
        None
    };

    let env = Env::new();
    let gateway_settings = GatewaySettings::from_env(&env);
    let stripe_settings = StripeSettings::from_env(&env);
    let free_tier_usd = free_tier.unwrap_or_else(|| config::free_tier_usd(&env));

    let pool = Arc::new(UsagePool::from_env());
    match pool.acquire().await {
        Some(pg) => {
            init_usage_schema(&pg).await?;
            Ledger::new(pg).init_schema().await?;
        }
        None => {
            tracing::warn!("starting without a database; usage and billing writes are disabled");
        }
    }

    let api_base = format!("{}/v1", gateway_settings.base_url.trim_end_matches('/'));
    let gateway: Arc<dyn AdminGateway> = Arc::new(HttpAdminGateway::new(gateway_settings));

    let mut state = BillingHttpState::new(pool, gateway)
        .with_stripe_settings(stripe_settings)
        .with_free_tier(free_tier_usd)
        .with_charge_dedup(dedup_charges)
        .with_api_base(api_base);
    if !signup_models.is_empty() {
        state = state.with_signup_models(signup_models);
    }
    if let Some(duration) = key_duration {
        state = state.with_key_duration(duration);
    }

    let app = tollgate::billing::http::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    println!("tollgate-billingd listening on {listen}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_fmt_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init()?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init()?;
    }
    Ok(())
}

#[cfg(feature = "otel")]
fn attach_otel(
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<tollgate::otel::OtelGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let config = tollgate::otel::TracingConfig {
        service_name: "tollgate-billingd".to_string(),
        otlp_endpoint: endpoint.map(|value| value.to_string()),
        json_logs,
    };
    Ok(Some(tollgate::otel::init(&config)?))
}

#[cfg(not(feature = "otel"))]
fn attach_otel(
    _endpoint: Option<&str>,
    _json_logs: bool,
) -> Result<Option<()>, Box<dyn std::error::Error + Send + Sync>> {
    Err("otel requires `--features otel`".into())
}
