use crate::config::Settings;

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;

/// Registry entry for an in-flight call.  Dispatch is per-connection; the
/// registry exists for membership and observability only.
pub struct ActiveCall {
    pub call_sid: String,
    pub tenant_id: String,
    pub started: OffsetDateTime,
}

pub struct AppState {
    pub settings: Settings,
    pub db: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// stream sid => active call; the mutex guards membership changes only.
    pub calls: Mutex<HashMap<String, ActiveCall>>,
}
