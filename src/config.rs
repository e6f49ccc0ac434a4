use std::env;
use std::path::PathBuf;

/// Runtime settings, read once at startup.  Everything has a default except
/// the OpenAI key, so a bare `.env` with one line is enough for local runs.
#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    /// Public https base URL of this server, used to build the wss stream URL
    /// handed to Twilio.  Falls back to the request Host header when unset.
    pub public_base_url: Option<String>,
    pub openai_api_key: String,
    pub realtime_url: String,
    pub realtime_model: String,
    pub summary_model: String,
    pub voice: String,
    pub database_url: Option<String>,
    pub log_dir: PathBuf,
    pub system_prompt_path: PathBuf,
    pub base64_passthrough: bool,
    pub smart_cancel: bool,
    pub vad_silence_ms: u32,
    pub vad_threshold: f32,
    pub barge_in_debounce_ms: u64,
    pub barge_in_min_remain_ms: u64,
    pub session_ready_timeout_ms: u64,
    pub timing_summary_interval_ms: u64,
    pub local_utc_offset_hours: i8,
    pub debug_audio_events: bool,
}

impl Settings {
    /// Load configuration from environment variables, reading a `.env` file
    /// first if one is present.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let _ = dotenvy::dotenv();

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|e| format!("invalid PORT: {e}"))?;
        let public_base_url = env::var("PUBLIC_BASE_URL").ok();

        let openai_api_key = env::var("OPENAI_API_KEY").map_err(|_| "OPENAI_API_KEY not set")?;
        let realtime_url = env::var("OPENAI_REALTIME_URL")
            .unwrap_or_else(|_| "wss://api.openai.com/v1/realtime".to_string());
        let realtime_model = env::var("OPENAI_REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview".to_string());
        let summary_model =
            env::var("SUMMARY_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let voice = env::var("OPENAI_VOICE").unwrap_or_else(|_| "alloy".to_string());

        let database_url = env::var("DATABASE_URL").ok();
        let log_dir = env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("call_logs"));
        let system_prompt_path = env::var("SYSTEM_PROMPT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("system_prompt.md"));

        let base64_passthrough = env_bool("BASE64_PASSTHROUGH", true);
        let smart_cancel = env_bool("SMART_CANCEL", true);
        let vad_silence_ms = env_parse("VAD_SILENCE_MS", 700u32)?;
        let vad_threshold = env_parse("VAD_THRESHOLD", 0.7f32)?;
        let barge_in_debounce_ms = env_parse("BARGE_IN_DEBOUNCE_MS", 1_000u64)?;
        let barge_in_min_remain_ms = env_parse("BARGE_IN_MIN_REMAIN_MS", 2_000u64)?;
        let session_ready_timeout_ms = env_parse("SESSION_READY_TIMEOUT_MS", 3_000u64)?;
        let timing_summary_interval_ms = env_parse("TIMING_SUMMARY_INTERVAL_MS", 15_000u64)?;
        let local_utc_offset_hours = env_parse("LOCAL_UTC_OFFSET_HOURS", 9i8)?;
        let debug_audio_events = env_bool("DEBUG_AUDIO_EVENTS", false);

        Ok(Settings {
            port,
            public_base_url,
            openai_api_key,
            realtime_url,
            realtime_model,
            summary_model,
            voice,
            database_url,
            log_dir,
            system_prompt_path,
            base64_passthrough,
            smart_cancel,
            vad_silence_ms,
            vad_threshold,
            barge_in_debounce_ms,
            barge_in_min_remain_ms,
            session_ready_timeout_ms,
            timing_summary_interval_ms,
            local_utc_offset_hours,
            debug_audio_events,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v.parse::<T>().map_err(|e| format!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
