//! Usage metering and billing ledger for an LLM gateway.

pub mod config;
pub mod gateway_admin;
pub mod http;
pub mod ledger;
pub mod pool;
pub mod reporter;
pub mod stripe;
pub mod telemetry;
pub mod usage;

pub use config::{Env, GatewaySettings, PgSettings, StripeSettings};
pub use gateway_admin::{AdminGateway, HttpAdminGateway, KeyRequest};
pub use http::BillingHttpState;
pub use ledger::{CreditOutcome, Ledger};
pub use pool::UsagePool;
pub use reporter::{TenantUsage, UsageReporter};
pub use telemetry::{EventInstant, RequestContext, ResponseContext, TelemetrySink};
pub use usage::UsageRecord;
