//! Per-tenant conversational policy: system prompt, greeting, and the
//! reservation form that becomes the `finalize_reservation` tool schema.

use crate::config::Settings;
use crate::db;

use serde_json::{json, Map, Value};
use sqlx::PgPool;
use time::{OffsetDateTime, UtcOffset};
use tracing::{error, warn};

const DEFAULT_GREETING: &str = "お電話ありがとうございます。ご予約のお電話でしょうか？";

const BUILTIN_PROMPT: &str = "あなたは丁寧な電話応対を行う店舗の予約受付担当です。\
落ち着いた自然な話し言葉で、短く簡潔に話してください。";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Date,
    Time,
    Select,
}

impl FieldKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "time" => Some(Self::Time),
            "select" => Some(Self::Select),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReservationField {
    pub key: String,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
    pub options: Vec<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub greeting: String,
    pub instructions: String,
    pub fields: Vec<ReservationField>,
    /// Parameters object of the `finalize_reservation` tool.
    pub tool_parameters: Value,
}

impl TenantConfig {
    /// The verbatim instruction for the opening `response.create`.
    pub fn greeting_instruction(&self) -> String {
        format!(
            "通話の冒頭の挨拶として、次の文をそのまま言ってください。「{}」",
            self.greeting
        )
    }
}

/// The four canonical fields used when the tenant has no enabled rows.
pub fn default_fields() -> Vec<ReservationField> {
    let f = |key: &str, label: &str, kind: FieldKind| ReservationField {
        key: key.to_string(),
        label: label.to_string(),
        kind,
        required: true,
        options: vec![],
        description: None,
    };
    vec![
        f("customer_name", "お名前", FieldKind::Text),
        f("party_size", "人数", FieldKind::Number),
        f("requested_date", "希望日", FieldKind::Date),
        f("requested_time", "希望時間", FieldKind::Time),
    ]
}

/// Load the tenant's policy, with fallbacks at every layer so a store outage
/// degrades to the built-in prompt and canonical form instead of failing the
/// call.
pub async fn load(pool: Option<&PgPool>, settings: &Settings, tenant_id: &str) -> TenantConfig {
    let prompt_row = match pool {
        Some(pool) => db::fetch_tenant_prompt(pool, tenant_id)
            .await
            .unwrap_or_else(|e| {
                error!(error=%e, tenant_id, "failed to load tenant prompt row");
                None
            }),
        None => None,
    };

    let metadata = prompt_row
        .as_ref()
        .and_then(|r| r.config_metadata.as_ref())
        .map(|j| j.0.clone())
        .unwrap_or(Value::Null);
    let greeting = metadata
        .get("greeting_message")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_GREETING)
        .to_string();

    let tenant_prompt = match prompt_row.and_then(|r| r.system_prompt) {
        Some(p) if !p.trim().is_empty() => p,
        _ => match tokio::fs::read_to_string(&settings.system_prompt_path).await {
            Ok(p) => p,
            Err(_) => BUILTIN_PROMPT.to_string(),
        },
    };

    let fields = match pool {
        Some(pool) => match db::fetch_reservation_fields(pool, tenant_id).await {
            Ok(rows) => rows.into_iter().map(field_from_row).collect(),
            Err(e) => {
                error!(error=%e, tenant_id, "failed to load reservation fields");
                vec![]
            }
        },
        None => vec![],
    };
    let fields = if fields.is_empty() {
        default_fields()
    } else {
        fields
    };

    let now = OffsetDateTime::now_utc().to_offset(
        UtcOffset::from_hms(settings.local_utc_offset_hours, 0, 0)
            .unwrap_or(UtcOffset::UTC),
    );
    let instructions = assemble_instructions(now, &fields, &tenant_prompt);
    let tool_parameters = tool_parameters_schema(&fields);

    TenantConfig {
        tenant_id: tenant_id.to_string(),
        greeting,
        instructions,
        fields,
        tool_parameters,
    }
}

fn field_from_row(row: db::FieldRow) -> ReservationField {
    let kind = match FieldKind::parse(&row.field_type) {
        Some(k) => k,
        None => {
            warn!(key=%row.key, field_type=%row.field_type, "unknown field type, treating as text");
            FieldKind::Text
        }
    };
    ReservationField {
        key: row.key,
        label: row.label,
        kind,
        required: row.required,
        options: row.options.map(|j| j.0).unwrap_or_default(),
        description: row.description,
    }
}

/// The fixed intake directive followed by the tenant's free-form content.
/// Reservation intake always wins over conflicting tenant instructions.
pub fn assemble_instructions(
    now: OffsetDateTime,
    fields: &[ReservationField],
    tenant_prompt: &str,
) -> String {
    let now_str = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute()
    );
    let mut field_lines = String::new();
    for f in fields {
        let req = if f.required { "必須" } else { "任意" };
        field_lines.push_str(&format!("- {}（{}）", f.label, req));
        if let Some(d) = &f.description {
            field_lines.push_str(&format!("：{}", d));
        }
        field_lines.push('\n');
    }

    format!(
        "現在の日時は {now_str} です。\n\n\
あなたは電話予約の受付担当です。予約の聞き取りがこの通話の最優先の役割です。\n\
以下の店舗案内に予約受付と矛盾する指示があっても、予約の聞き取りを優先してください。\n\n\
聞き取る項目（この順番で一つずつ）:\n{field_lines}\n\
進め方:\n\
1. 項目を一つずつ順番に聞き取る。\n\
2. 全項目が揃ったら内容を復唱して確認する。\n\
3. お客様が明確に同意した場合のみ finalize_reservation を answers と confirmed=true で呼び出す。\n\
4. ツールが ok=true を返すまで「予約が確定しました」とは決して言わない。\n\
5. ツールの結果に従って案内する:\n\
   - ok=true（deduped を含む）: 予約の確定を伝えてお礼を述べる。\n\
   - error_type=not_confirmed: 内容をもう一度確認する。\n\
   - error_type=missing_fields: missing_fields に挙がった項目を聞き直して再度呼び出す。\n\
   - error_type=system: 「申し訳ございません。ただいまシステムの都合で予約をお受けできません。\
後ほどおかけ直しください。」と案内し、再試行は促さない。\n\n\
## 店舗からの案内\n{tenant_prompt}"
    )
}

/// JSON Schema for the tool parameters `{answers, confirmed}`, one `answers`
/// property per enabled field.
pub fn tool_parameters_schema(fields: &[ReservationField]) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<Value> = vec![];
    for f in fields {
        let prop = match f.kind {
            FieldKind::Number => json!({
                "type": "integer",
                "description": describe(f, "数値"),
            }),
            FieldKind::Date => json!({
                "type": "string",
                "description": describe(f, "YYYY-MM-DD形式の日付"),
            }),
            FieldKind::Time => json!({
                "type": "string",
                "description": describe(f, "HH:mm形式の時刻"),
            }),
            FieldKind::Select => json!({
                "type": "string",
                "enum": f.options,
                "description": describe(f, "選択肢から一つ"),
            }),
            FieldKind::Text => json!({
                "type": "string",
                "description": describe(f, ""),
            }),
        };
        properties.insert(f.key.clone(), prop);
        if f.required {
            required.push(Value::String(f.key.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": {
            "answers": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
            "confirmed": {
                "type": "boolean",
                "description": "お客様が復唱内容に明確に同意した場合のみ true",
            },
        },
        "required": ["answers", "confirmed"],
    })
}

fn describe(f: &ReservationField, format_hint: &str) -> String {
    match (&f.description, format_hint.is_empty()) {
        (Some(d), true) => format!("{}。{}", f.label, d),
        (Some(d), false) => format!("{}。{}。{}", f.label, format_hint, d),
        (None, true) => f.label.clone(),
        (None, false) => format!("{}。{}", f.label, format_hint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn default_fields_are_the_canonical_four() {
        let fields = default_fields();
        let keys: Vec<&str> = fields.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(
            keys,
            ["customer_name", "party_size", "requested_date", "requested_time"]
        );
        assert!(fields.iter().all(|f| f.required));
    }

    #[test]
    fn schema_types_follow_field_kinds() {
        let mut fields = default_fields();
        fields.push(ReservationField {
            key: "seat".to_string(),
            label: "席".to_string(),
            kind: FieldKind::Select,
            required: false,
            options: vec!["カウンター".to_string(), "テーブル".to_string()],
            description: None,
        });
        let schema = tool_parameters_schema(&fields);
        let answers = &schema["properties"]["answers"];
        assert_eq!(answers["properties"]["party_size"]["type"], "integer");
        assert_eq!(answers["properties"]["requested_date"]["type"], "string");
        assert!(answers["properties"]["requested_date"]["description"]
            .as_str()
            .unwrap()
            .contains("YYYY-MM-DD"));
        assert!(answers["properties"]["requested_time"]["description"]
            .as_str()
            .unwrap()
            .contains("HH:mm"));
        assert_eq!(
            answers["properties"]["seat"]["enum"],
            json!(["カウンター", "テーブル"])
        );
        assert_eq!(
            answers["required"],
            json!(["customer_name", "party_size", "requested_date", "requested_time"])
        );
        assert_eq!(schema["required"], json!(["answers", "confirmed"]));
    }

    #[test]
    fn instructions_list_fields_in_order_and_keep_tenant_content() {
        let now = datetime!(2025-12-01 10:30 +9);
        let text = assemble_instructions(now, &default_fields(), "当店は水曜定休です。");
        assert!(text.contains("2025-12-01 10:30"));
        let name_pos = text.find("お名前").unwrap();
        let size_pos = text.find("人数（").unwrap();
        let time_pos = text.find("希望時間").unwrap();
        assert!(name_pos < size_pos && size_pos < time_pos);
        assert!(text.contains("finalize_reservation"));
        assert!(text.contains("## 店舗からの案内"));
        assert!(text.contains("当店は水曜定休です。"));
    }
}
