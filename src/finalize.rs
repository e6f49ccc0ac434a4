//! The reservation finalizer: validation, unique-key insert with race-safe
//! dedupe, and the notification hand-off.
//!
//! Invoked when the model emits a `finalize_reservation` function call on a
//! `response.done`.  Outcomes are a tagged variant serialized to the wire in
//! exactly one place (`FinalizeOutcome::to_wire`); the session instructions
//! tell the model what to say for each branch.

use crate::db::{self, InsertOutcome, NewReservation};
use crate::notify;
use crate::tenant::{FieldKind, ReservationField, TenantConfig};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{2}:\d{2}$").unwrap());

#[derive(Debug, PartialEq)]
pub enum FinalizeOutcome {
    Ok {
        reservation_id: Option<Uuid>,
        deduped: bool,
    },
    NotConfirmed,
    MissingFields {
        labels: Vec<String>,
    },
    System {
        code: &'static str,
    },
}

impl FinalizeOutcome {
    /// The single serialization point for the `function_call_output` payload.
    pub fn to_wire(&self) -> Value {
        match self {
            FinalizeOutcome::Ok {
                reservation_id,
                deduped,
            } => {
                let mut obj = Map::new();
                obj.insert("ok".to_string(), Value::Bool(true));
                if let Some(id) = reservation_id {
                    obj.insert(
                        "reservation_id".to_string(),
                        Value::String(id.to_string()),
                    );
                }
                obj.insert("deduped".to_string(), Value::Bool(*deduped));
                Value::Object(obj)
            }
            FinalizeOutcome::NotConfirmed => serde_json::json!({
                "ok": false,
                "error_type": "not_confirmed",
            }),
            FinalizeOutcome::MissingFields { labels } => serde_json::json!({
                "ok": false,
                "error_type": "missing_fields",
                "missing_fields": labels,
            }),
            FinalizeOutcome::System { code } => serde_json::json!({
                "ok": false,
                "error_type": "system",
                "error_code": code,
            }),
        }
    }
}

/// Arguments that survived validation, coerced and ready to persist.
#[derive(Debug)]
pub struct ValidatedAnswers {
    /// Coerced answers keyed by field key; unknown keys pass through.
    pub answers: Map<String, Value>,
    pub customer_name: Option<String>,
    pub party_size: Option<i32>,
    pub requested_date: Option<String>,
    pub requested_time: Option<String>,
}

/// Steps 1–6 of the finalize flow: parse, guard, structure, consent, per-field
/// coercion, required check.  Pure so the whole taxonomy is testable without
/// a store.
pub fn validate_arguments(
    raw: &str,
    fields: &[ReservationField],
) -> Result<ValidatedAnswers, FinalizeOutcome> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Err(FinalizeOutcome::System { code: "PARSE_ERROR" }),
    };

    // Zero required fields is a tenant-config bug, never a caller mistake.
    if !fields.iter().any(|f| f.required) {
        return Err(FinalizeOutcome::System {
            code: "NO_REQUIRED_FIELDS",
        });
    }

    let mut answers = match parsed.get("answers") {
        Some(Value::Object(map)) => map.clone(),
        _ => {
            return Err(FinalizeOutcome::System {
                code: "INVALID_ANSWERS_FORMAT",
            })
        }
    };

    if parsed.get("confirmed") != Some(&Value::Bool(true)) {
        return Err(FinalizeOutcome::NotConfirmed);
    }

    let mut missing: Vec<String> = vec![];
    for field in fields {
        let value = answers.get(&field.key).cloned().unwrap_or(Value::Null);
        match coerce_value(field, value) {
            Coerced::Value(v) => {
                answers.insert(field.key.clone(), v);
            }
            Coerced::Missing => {
                answers.insert(field.key.clone(), Value::Null);
                if field.required {
                    missing.push(field.label.clone());
                }
            }
            Coerced::FormatError(hint) => {
                answers.insert(field.key.clone(), Value::Null);
                if field.required {
                    missing.push(format!("{}（{}）", field.label, hint));
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(FinalizeOutcome::MissingFields { labels: missing });
    }

    let customer_name = answers
        .get("customer_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let party_size = answers
        .get("party_size")
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok());
    let requested_date = answers
        .get("requested_date")
        .and_then(Value::as_str)
        .map(str::to_string);
    let requested_time = answers
        .get("requested_time")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ValidatedAnswers {
        answers,
        customer_name,
        party_size,
        requested_date,
        requested_time,
    })
}

enum Coerced {
    Value(Value),
    Missing,
    FormatError(&'static str),
}

fn coerce_value(field: &ReservationField, value: Value) -> Coerced {
    match field.kind {
        FieldKind::Number => match value {
            Value::Number(ref n) if n.as_i64().is_some() => Coerced::Value(value),
            Value::String(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    if s.trim().is_empty() {
                        Coerced::Missing
                    } else {
                        Coerced::FormatError("数値")
                    }
                } else {
                    match digits.parse::<i64>() {
                        Ok(n) => Coerced::Value(Value::from(n)),
                        Err(_) => Coerced::FormatError("数値"),
                    }
                }
            }
            Value::Null => Coerced::Missing,
            _ => Coerced::FormatError("数値"),
        },
        FieldKind::Date => match value {
            Value::String(s) if DATE_RE.is_match(&s) => Coerced::Value(Value::String(s)),
            Value::String(s) if s.trim().is_empty() => Coerced::Missing,
            Value::Null => Coerced::Missing,
            _ => Coerced::FormatError("YYYY-MM-DD形式"),
        },
        FieldKind::Time => match value {
            Value::String(s) if TIME_RE.is_match(&s) => Coerced::Value(Value::String(s)),
            Value::String(s) if s.trim().is_empty() => Coerced::Missing,
            Value::Null => Coerced::Missing,
            _ => Coerced::FormatError("HH:mm形式"),
        },
        FieldKind::Text | FieldKind::Select => match value {
            Value::String(s) if !s.trim().is_empty() => Coerced::Value(Value::String(s)),
            _ => Coerced::Missing,
        },
    }
}

pub struct FinalizeContext<'a> {
    pub pool: Option<&'a PgPool>,
    pub http: &'a reqwest::Client,
    pub tenant: &'a TenantConfig,
    pub call_sid: &'a str,
    pub caller_number: Option<&'a str>,
}

/// Steps 1–8: validate, persist with the `call_sid` unique key, dedupe, and
/// hand off notifications on a fresh insert.  The NDJSON `tool_call` record
/// and the wire send are the orchestrator's step 9.
pub async fn handle(ctx: FinalizeContext<'_>, raw_arguments: &str) -> FinalizeOutcome {
    let validated = match validate_arguments(raw_arguments, &ctx.tenant.fields) {
        Ok(v) => v,
        Err(outcome) => return outcome,
    };

    let pool = match ctx.pool {
        Some(p) => p,
        None => {
            error!(call_sid=%ctx.call_sid, "reservation store unavailable");
            return FinalizeOutcome::System {
                code: "DB_INSERT_FAILED",
            };
        }
    };

    let answers_value = Value::Object(validated.answers.clone());
    let insert = db::insert_reservation(
        pool,
        NewReservation {
            tenant_id: &ctx.tenant.tenant_id,
            call_sid: ctx.call_sid,
            customer_name: validated.customer_name.as_deref(),
            customer_phone: ctx.caller_number,
            party_size: validated.party_size,
            requested_date: validated.requested_date.as_deref(),
            requested_time: validated.requested_time.as_deref(),
            answers: &answers_value,
            source: "tool",
        },
    )
    .await;

    match insert {
        Ok(InsertOutcome::Inserted(id)) => {
            info!(call_sid=%ctx.call_sid, reservation_id=%id, "reservation committed");
            let payload = notify::NotificationPayload::new(
                ctx.tenant,
                ctx.call_sid,
                ctx.caller_number,
                id,
                &validated.answers,
            );
            notify::dispatch(
                ctx.http.clone(),
                ctx.pool.cloned(),
                ctx.tenant.tenant_id.clone(),
                payload,
            );
            FinalizeOutcome::Ok {
                reservation_id: Some(id),
                deduped: false,
            }
        }
        Ok(InsertOutcome::Duplicate) => {
            info!(call_sid=%ctx.call_sid, "duplicate finalize call deduped");
            FinalizeOutcome::Ok {
                reservation_id: None,
                deduped: true,
            }
        }
        Err(e) => {
            error!(error=%e, call_sid=%ctx.call_sid, "reservation insert failed");
            FinalizeOutcome::System {
                code: "DB_INSERT_FAILED",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::default_fields;
    use serde_json::json;

    fn valid_args() -> String {
        json!({
            "answers": {
                "customer_name": "田中",
                "party_size": 2,
                "requested_date": "2025-12-20",
                "requested_time": "19:00"
            },
            "confirmed": true
        })
        .to_string()
    }

    #[test]
    fn happy_path_coerces_and_extracts_columns() {
        let v = validate_arguments(&valid_args(), &default_fields()).unwrap();
        assert_eq!(v.customer_name.as_deref(), Some("田中"));
        assert_eq!(v.party_size, Some(2));
        assert_eq!(v.requested_date.as_deref(), Some("2025-12-20"));
        assert_eq!(v.requested_time.as_deref(), Some("19:00"));
    }

    #[test]
    fn parse_error_is_a_system_outcome() {
        let out = validate_arguments("{not json", &default_fields()).unwrap_err();
        assert_eq!(out, FinalizeOutcome::System { code: "PARSE_ERROR" });
        assert_eq!(out.to_wire()["error_code"], "PARSE_ERROR");
    }

    #[test]
    fn zero_required_fields_is_a_config_bug() {
        let mut fields = default_fields();
        for f in &mut fields {
            f.required = false;
        }
        let out = validate_arguments(&valid_args(), &fields).unwrap_err();
        assert_eq!(
            out,
            FinalizeOutcome::System {
                code: "NO_REQUIRED_FIELDS"
            }
        );
    }

    #[test]
    fn answers_must_be_an_object() {
        for raw in [
            r#"{"answers": [], "confirmed": true}"#,
            r#"{"answers": null, "confirmed": true}"#,
            r#"{"confirmed": true}"#,
        ] {
            let out = validate_arguments(raw, &default_fields()).unwrap_err();
            assert_eq!(
                out,
                FinalizeOutcome::System {
                    code: "INVALID_ANSWERS_FORMAT"
                }
            );
        }
    }

    #[test]
    fn consent_must_be_exactly_boolean_true() {
        for confirmed in [json!(false), json!("true"), json!(1), Value::Null] {
            let raw = json!({
                "answers": {
                    "customer_name": "田中",
                    "party_size": 2,
                    "requested_date": "2025-12-20",
                    "requested_time": "19:00"
                },
                "confirmed": confirmed
            })
            .to_string();
            let out = validate_arguments(&raw, &default_fields()).unwrap_err();
            assert_eq!(out, FinalizeOutcome::NotConfirmed);
            assert_eq!(out.to_wire()["error_type"], "not_confirmed");
        }
    }

    #[test]
    fn missing_required_time_reports_its_label() {
        let raw = json!({
            "answers": {
                "customer_name": "田中",
                "party_size": 2,
                "requested_date": "2025-12-20"
            },
            "confirmed": true
        })
        .to_string();
        let out = validate_arguments(&raw, &default_fields()).unwrap_err();
        assert_eq!(
            out,
            FinalizeOutcome::MissingFields {
                labels: vec!["希望時間".to_string()]
            }
        );
        assert_eq!(out.to_wire()["missing_fields"], json!(["希望時間"]));
    }

    #[test]
    fn number_strings_are_stripped_and_parsed() {
        let raw = json!({
            "answers": {
                "customer_name": "田中",
                "party_size": "2名",
                "requested_date": "2025-12-20",
                "requested_time": "19:00"
            },
            "confirmed": true
        })
        .to_string();
        let v = validate_arguments(&raw, &default_fields()).unwrap();
        assert_eq!(v.party_size, Some(2));
        assert_eq!(v.answers["party_size"], json!(2));
    }

    #[test]
    fn bad_date_format_carries_a_hint() {
        let raw = json!({
            "answers": {
                "customer_name": "田中",
                "party_size": 2,
                "requested_date": "12月20日",
                "requested_time": "19:00"
            },
            "confirmed": true
        })
        .to_string();
        let out = validate_arguments(&raw, &default_fields()).unwrap_err();
        match out {
            FinalizeOutcome::MissingFields { labels } => {
                assert_eq!(labels, vec!["希望日（YYYY-MM-DD形式）".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn empty_text_counts_as_missing() {
        let raw = json!({
            "answers": {
                "customer_name": "  ",
                "party_size": 2,
                "requested_date": "2025-12-20",
                "requested_time": "19:00"
            },
            "confirmed": true
        })
        .to_string();
        let out = validate_arguments(&raw, &default_fields()).unwrap_err();
        assert_eq!(
            out,
            FinalizeOutcome::MissingFields {
                labels: vec!["お名前".to_string()]
            }
        );
    }

    #[test]
    fn unknown_answer_keys_pass_through_untouched() {
        let raw = json!({
            "answers": {
                "customer_name": "田中",
                "party_size": 2,
                "requested_date": "2025-12-20",
                "requested_time": "19:00",
                "note": "窓際の席を希望"
            },
            "confirmed": true
        })
        .to_string();
        let v = validate_arguments(&raw, &default_fields()).unwrap();
        assert_eq!(v.answers["note"], json!("窓際の席を希望"));
    }

    #[test]
    fn invalid_optional_value_is_nulled_not_fatal() {
        let mut fields = default_fields();
        fields[2].required = false; // requested_date optional
        let raw = json!({
            "answers": {
                "customer_name": "田中",
                "party_size": 2,
                "requested_date": "来週の金曜",
                "requested_time": "19:00"
            },
            "confirmed": true
        })
        .to_string();
        let v = validate_arguments(&raw, &fields).unwrap();
        assert_eq!(v.answers["requested_date"], Value::Null);
        assert_eq!(v.requested_date, None);
    }

    #[test]
    fn wire_shapes_for_success_and_dedupe() {
        let id = Uuid::new_v4();
        let fresh = FinalizeOutcome::Ok {
            reservation_id: Some(id),
            deduped: false,
        }
        .to_wire();
        assert_eq!(fresh["ok"], true);
        assert_eq!(fresh["deduped"], false);
        assert_eq!(fresh["reservation_id"], json!(id.to_string()));

        let deduped = FinalizeOutcome::Ok {
            reservation_id: None,
            deduped: true,
        }
        .to_wire();
        assert_eq!(deduped["ok"], true);
        assert_eq!(deduped["deduped"], true);
        assert!(deduped.get("reservation_id").is_none());
    }
}
