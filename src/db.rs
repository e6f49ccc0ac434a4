//! Row types and queries for the tabular stores: reservations (read/write),
//! tenant prompts and reservation form fields (read-only), notification
//! settings (read-only), call logs (write + linkage).

use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::error;
use uuid::Uuid;

#[derive(FromRow, Debug)]
pub struct TenantPromptRow {
    pub system_prompt: Option<String>,
    pub config_metadata: Option<Json<serde_json::Value>>,
}

#[derive(FromRow, Debug)]
pub struct FieldRow {
    pub key: String,
    pub label: String,
    pub field_type: String,
    pub required: bool,
    pub options: Option<Json<Vec<String>>>,
    pub description: Option<String>,
}

#[derive(FromRow, Debug)]
pub struct NotificationRow {
    pub channel: String,
    pub target: String,
}

pub struct NewReservation<'a> {
    pub tenant_id: &'a str,
    pub call_sid: &'a str,
    pub customer_name: Option<&'a str>,
    pub customer_phone: Option<&'a str>,
    pub party_size: Option<i32>,
    pub requested_date: Option<&'a str>,
    pub requested_time: Option<&'a str>,
    pub answers: &'a serde_json::Value,
    pub source: &'a str,
}

/// Result of the unique-key insert: either a fresh row or a concurrent
/// duplicate on `call_sid`, which is idempotent success.
pub enum InsertOutcome {
    Inserted(Uuid),
    Duplicate,
}

pub async fn fetch_tenant_prompt(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Option<TenantPromptRow>, sqlx::Error> {
    sqlx::query_as::<_, TenantPromptRow>(
        "select system_prompt, config_metadata from tenant_prompts where tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}

pub async fn fetch_reservation_fields(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Vec<FieldRow>, sqlx::Error> {
    sqlx::query_as::<_, FieldRow>(
        "select key, label, field_type, required, options, description
         from reservation_fields
         where tenant_id = $1 and enabled
         order by display_order",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

pub async fn fetch_notification_settings(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Vec<NotificationRow>, sqlx::Error> {
    sqlx::query_as::<_, NotificationRow>(
        "select channel, target from notification_settings where tenant_id = $1 and enabled",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

/// Insert with `call_sid` as the unique key.  `on conflict do nothing`
/// resolves the duplicate race without a serialization failure; the losing
/// writer sees no returned row.
pub async fn insert_reservation(
    pool: &PgPool,
    row: NewReservation<'_>,
) -> Result<InsertOutcome, sqlx::Error> {
    let id = Uuid::new_v4();
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        "insert into reservations
           (id, tenant_id, call_sid, customer_name, customer_phone, party_size,
            requested_date, requested_time, answers, status, source)
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
         on conflict (call_sid) do nothing
         returning id",
    )
    .bind(id)
    .bind(row.tenant_id)
    .bind(row.call_sid)
    .bind(row.customer_name)
    .bind(row.customer_phone)
    .bind(row.party_size)
    .bind(row.requested_date)
    .bind(row.requested_time)
    .bind(Json(row.answers))
    .bind(row.source)
    .fetch_optional(pool)
    .await?;
    Ok(match inserted {
        Some((id,)) => InsertOutcome::Inserted(id),
        None => InsertOutcome::Duplicate,
    })
}

pub struct NewCallLog<'a> {
    pub call_sid: &'a str,
    pub stream_sid: &'a str,
    pub tenant_id: &'a str,
    pub caller_number: Option<&'a str>,
    pub callee_number: Option<&'a str>,
    pub transcript: &'a serde_json::Value,
    pub summary: Option<&'a str>,
}

pub async fn insert_call_log(pool: &PgPool, row: NewCallLog<'_>) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    let (id,): (Uuid,) = sqlx::query_as(
        "insert into call_logs
           (id, call_sid, stream_sid, tenant_id, caller_number, callee_number, transcript, summary)
         values ($1, $2, $3, $4, $5, $6, $7, $8)
         on conflict (call_sid) do update
           set transcript = excluded.transcript, summary = excluded.summary
         returning id",
    )
    .bind(id)
    .bind(row.call_sid)
    .bind(row.stream_sid)
    .bind(row.tenant_id)
    .bind(row.caller_number)
    .bind(row.callee_number)
    .bind(Json(row.transcript))
    .bind(row.summary)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Point the call's reservation at its call log.  Returns the number of rows
/// updated; zero means no reservation was captured on this call.
pub async fn link_reservation_call_log(
    pool: &PgPool,
    call_sid: &str,
    call_log_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("update reservations set call_log_id = $1 where call_sid = $2")
        .bind(call_log_id)
        .bind(call_sid)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn connect_pool(database_url: &str) -> Option<PgPool> {
    match sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            error!(error=%e, "failed to connect reservation store; running with fallbacks");
            None
        }
    }
}
