pub mod billing;
mod error;

#[cfg(feature = "otel")]
pub mod otel;

pub use billing::{
    AdminGateway, BillingHttpState, CreditOutcome, Env, EventInstant, GatewaySettings,
    HttpAdminGateway, KeyRequest, Ledger, PgSettings, RequestContext, ResponseContext,
    StripeSettings, TelemetrySink, TenantUsage, UsagePool, UsageRecord, UsageReporter,
};
pub use error::{BillingError, Result};
