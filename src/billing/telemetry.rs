use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::pool::UsagePool;
use super::usage::{UsageRecord, insert_usage};

/// Request-side fields of a telemetry event. Every field is optional; the
/// gateway does not guarantee any of them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseContext {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub usage: Option<UsageCounters>,
    #[serde(default)]
    pub response_cost: Option<Decimal>,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub response_cost: Option<Decimal>,
}

impl ResponseContext {
    /// First non-null of the direct status and the numeric status code.
    pub fn resolved_status(&self) -> Option<String> {
        self.status
            .clone()
            .or_else(|| self.status_code.map(|code| code.to_string()))
    }

    /// First non-null of the direct cost and the nested metadata fallback.
    pub fn resolved_cost(&self) -> Option<Decimal> {
        self.response_cost.or(self.metadata.response_cost)
    }

    /// First non-null of the response id and the fallback request id.
    pub fn resolved_request_id(&self) -> Option<String> {
        self.id.clone().or_else(|| self.request_id.clone())
    }
}

/// A point in time as the gateway reports it: either raw epoch seconds or a
/// split seconds/nanos pair.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventInstant {
    Epoch(f64),
    Precise {
        secs: i64,
        #[serde(default)]
        nanos: u32,
    },
}

impl EventInstant {
    fn as_millis(self) -> Option<f64> {
        match self {
            EventInstant::Epoch(seconds) if seconds.is_finite() => Some(seconds * 1000.0),
            EventInstant::Epoch(_) => None,
            EventInstant::Precise { secs, nanos } => {
                Some(secs as f64 * 1000.0 + f64::from(nanos) / 1_000_000.0)
            }
        }
    }
}

/// Latency is always derived from the start/end pair, never copied from
/// payload metadata. Anything unusable degrades to 0.
pub fn latency_ms(start: Option<EventInstant>, end: Option<EventInstant>) -> i64 {
    let (Some(start), Some(end)) = (start, end) else {
        return 0;
    };
    let (Some(start_ms), Some(end_ms)) = (start.as_millis(), end.as_millis()) else {
        return 0;
    };
    let elapsed = end_ms - start_ms;
    if !elapsed.is_finite() || elapsed <= 0.0 {
        return 0;
    }
    elapsed.round() as i64
}

pub fn build_usage_record(
    request: Option<&RequestContext>,
    response: Option<&ResponseContext>,
    start: Option<EventInstant>,
    end: Option<EventInstant>,
) -> UsageRecord {
    let usage = response.and_then(|response| response.usage.as_ref());
    UsageRecord {
        tenant_id: request.and_then(|request| request.metadata.tenant_id.clone()),
        model: request.and_then(|request| request.model.clone()),
        prompt_tokens: usage.and_then(|usage| usage.prompt_tokens),
        completion_tokens: usage.and_then(|usage| usage.completion_tokens),
        total_tokens: usage.and_then(|usage| usage.total_tokens),
        latency_ms: latency_ms(start, end),
        status: response.and_then(ResponseContext::resolved_status),
        cost_usd: response.and_then(ResponseContext::resolved_cost),
        request_id: response.and_then(ResponseContext::resolved_request_id),
    }
}

/// The request-lifecycle hook. Runs inside the gateway's completion path, so
/// nothing in here may propagate an error to the caller.
#[derive(Clone, Debug)]
pub struct TelemetrySink {
    pool: Arc<UsagePool>,
}

impl TelemetrySink {
    pub fn new(pool: Arc<UsagePool>) -> Self {
        Self { pool }
    }

    pub async fn log_event(
        &self,
        request: Option<&RequestContext>,
        response: Option<&ResponseContext>,
        start: Option<EventInstant>,
        end: Option<EventInstant>,
    ) {
        let record = build_usage_record(request, response, start, end);

        tracing::info!(
            tenant_id = ?record.tenant_id,
            model = ?record.model,
            prompt_tokens = ?record.prompt_tokens,
            completion_tokens = ?record.completion_tokens,
            total_tokens = ?record.total_tokens,
            latency_ms = record.latency_ms,
            status = ?record.status,
            cost_usd = ?record.cost_usd,
            request_id = ?record.request_id,
            "llm_request"
        );

        let Some(pool) = self.pool.acquire().await else {
            return;
        };
        if let Err(err) = insert_usage(&pool, &record).await {
            tracing::warn!(error = %err, "usage insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_from_epoch_seconds() {
        let start = Some(EventInstant::Epoch(1700000000.0));
        let end = Some(EventInstant::Epoch(1700000000.15));
        assert_eq!(latency_ms(start, end), 150);
    }

    #[test]
    fn latency_from_precise_pair() {
        let start = Some(EventInstant::Precise {
            secs: 1_700_000_000,
            nanos: 0,
        });
        let end = Some(EventInstant::Precise {
            secs: 1_700_000_000,
            nanos: 150_000_000,
        });
        assert_eq!(latency_ms(start, end), 150);
    }

    #[test]
    fn latency_defaults_to_zero_on_bad_input() {
        assert_eq!(latency_ms(None, None), 0);
        assert_eq!(
            latency_ms(
                Some(EventInstant::Epoch(f64::NAN)),
                Some(EventInstant::Epoch(1.0))
            ),
            0
        );
        // Clock skew: end before start.
        assert_eq!(
            latency_ms(
                Some(EventInstant::Epoch(200.0)),
                Some(EventInstant::Epoch(100.0))
            ),
            0
        );
    }

    #[test]
    fn cost_falls_back_to_metadata() {
        let mut response = ResponseContext::default();
        response.metadata.response_cost = Some(Decimal::new(2, 3));
        assert_eq!(response.resolved_cost(), Some(Decimal::new(2, 3)));

        response.response_cost = Some(Decimal::new(5, 3));
        assert_eq!(response.resolved_cost(), Some(Decimal::new(5, 3)));
    }

    #[test]
    fn status_falls_back_to_code() {
        let mut response = ResponseContext::default();
        assert_eq!(response.resolved_status(), None);

        response.status_code = Some(200);
        assert_eq!(response.resolved_status(), Some("200".to_string()));

        response.status = Some("success".to_string());
        assert_eq!(response.resolved_status(), Some("success".to_string()));
    }

    #[test]
    fn request_id_prefers_response_id() {
        let mut response = ResponseContext::default();
        response.request_id = Some("fallback".to_string());
        assert_eq!(response.resolved_request_id(), Some("fallback".to_string()));

        response.id = Some("chatcmpl-1".to_string());
        assert_eq!(
            response.resolved_request_id(),
            Some("chatcmpl-1".to_string())
        );
    }

    #[test]
    fn record_from_missing_contexts_is_empty() {
        let record = build_usage_record(None, None, None, None);
        assert_eq!(record, UsageRecord::default());
    }

    #[test]
    fn record_extracts_nested_fields() {
        let request: RequestContext = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "metadata": {"tenant_id": "t1"}
        }))
        .expect("request");
        let response: ResponseContext = serde_json::from_value(serde_json::json!({
            "id": "req-1",
            "status": "success",
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30},
            "response_cost": 0.002
        }))
        .expect("response");

        let record = build_usage_record(
            Some(&request),
            Some(&response),
            Some(EventInstant::Epoch(10.00)),
            Some(EventInstant::Epoch(10.15)),
        );
        assert_eq!(record.tenant_id.as_deref(), Some("t1"));
        assert_eq!(record.model.as_deref(), Some("gpt-4o"));
        assert_eq!(record.prompt_tokens, Some(10));
        assert_eq!(record.completion_tokens, Some(20));
        assert_eq!(record.total_tokens, Some(30));
        assert_eq!(record.latency_ms, 150);
        assert_eq!(record.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn sink_without_pool_completes_silently() {
        let sink = TelemetrySink::new(Arc::new(UsagePool::unconfigured()));
        sink.log_event(None, None, None, None).await;
    }
}
