//! At-least-once notification hand-off for fresh reservations.
//!
//! The core only speaks to webhook targets from the tenant's notification
//! settings; mail and chat transports live behind those webhooks.  Dispatch
//! runs in a spawned task so the tool result never waits on it, and failures
//! are logged, never propagated.

use crate::db;
use crate::tenant::TenantConfig;

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Serialize, Clone, Debug)]
pub struct NotificationPayload {
    pub tenant_id: String,
    pub call_sid: String,
    pub reservation_id: Uuid,
    pub caller_number: Option<String>,
    /// Answers keyed by the human label, in form order.  Persistence keys by
    /// field key; this is the presentation-side representation.
    pub answers: Vec<LabeledAnswer>,
}

#[derive(Serialize, Clone, Debug)]
pub struct LabeledAnswer {
    pub label: String,
    pub value: Value,
}

impl NotificationPayload {
    pub fn new(
        tenant: &TenantConfig,
        call_sid: &str,
        caller_number: Option<&str>,
        reservation_id: Uuid,
        answers: &Map<String, Value>,
    ) -> Self {
        let labeled = tenant
            .fields
            .iter()
            .map(|f| LabeledAnswer {
                label: f.label.clone(),
                value: answers.get(&f.key).cloned().unwrap_or(Value::Null),
            })
            .collect();
        Self {
            tenant_id: tenant.tenant_id.clone(),
            call_sid: call_sid.to_string(),
            reservation_id,
            caller_number: caller_number.map(str::to_string),
            answers: labeled,
        }
    }
}

/// Fire-and-forget entry point used by the finalizer.
pub fn dispatch(
    http: reqwest::Client,
    pool: Option<PgPool>,
    tenant_id: String,
    payload: NotificationPayload,
) {
    tokio::spawn(async move {
        deliver(http, pool, tenant_id, payload).await;
    });
}

async fn deliver(
    http: reqwest::Client,
    pool: Option<PgPool>,
    tenant_id: String,
    payload: NotificationPayload,
) {
    let targets = match &pool {
        Some(pool) => match db::fetch_notification_settings(pool, &tenant_id).await {
            Ok(t) => t,
            Err(e) => {
                error!(error=%e, tenant_id=%tenant_id, "failed to load notification settings");
                return;
            }
        },
        None => vec![],
    };
    if targets.is_empty() {
        info!(tenant_id=%tenant_id, "no notification targets configured");
        return;
    }

    for target in targets {
        match target.channel.as_str() {
            "webhook" => {
                let res = http.post(&target.target).json(&payload).send().await;
                match res {
                    Ok(resp) if resp.status().is_success() => {
                        info!(tenant_id=%tenant_id, target=%target.target, "notification delivered");
                    }
                    Ok(resp) => {
                        error!(tenant_id=%tenant_id, target=%target.target, status=%resp.status(),
                               "notification target rejected payload");
                    }
                    Err(e) => {
                        error!(error=%e, tenant_id=%tenant_id, target=%target.target,
                               "failed to deliver notification");
                    }
                }
            }
            other => {
                warn!(tenant_id=%tenant_id, channel=%other, "unsupported notification channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{default_fields, TenantConfig};
    use serde_json::json;

    fn tenant() -> TenantConfig {
        let fields = default_fields();
        TenantConfig {
            tenant_id: "t1".to_string(),
            greeting: "こんにちは".to_string(),
            instructions: String::new(),
            tool_parameters: crate::tenant::tool_parameters_schema(&fields),
            fields,
        }
    }

    #[test]
    fn payload_is_keyed_by_label_in_form_order() {
        let mut answers = Map::new();
        answers.insert("customer_name".to_string(), json!("田中"));
        answers.insert("party_size".to_string(), json!(2));
        answers.insert("requested_date".to_string(), json!("2025-12-20"));
        answers.insert("requested_time".to_string(), json!("19:00"));

        let payload = NotificationPayload::new(
            &tenant(),
            "CA1",
            Some("+8190"),
            Uuid::new_v4(),
            &answers,
        );
        let labels: Vec<&str> = payload.answers.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, ["お名前", "人数", "希望日", "希望時間"]);
        assert_eq!(payload.answers[1].value, json!(2));
    }
}
