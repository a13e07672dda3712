//! Environment-driven settings tree.
//!
//! One struct per concern, one `from_env()` each, mirroring the original
//! `config/settings.py` dataclasses field-for-field (including its
//! fallback-to-another-var defaults). A minimal `.env` loader is ported
//! verbatim from `_load_dotenv`: existing environment variables win.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `hour:minute`, falling back to `default` on any parse failure.
fn parse_time_of_day(value: &str, default: (u32, u32)) -> (u32, u32) {
    let mut parts = value.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(h), Some(m)) => match (h.parse(), m.parse()) {
            (Ok(h), Ok(m)) => (h, m),
            _ => default,
        },
        _ => default,
    }
}

/// Loads `KEY=value` lines from `path` into the process environment,
/// skipping blank/`#`-prefixed lines and never overriding a variable that
/// is already set. Ported from the Python original's stdlib-only loader.
pub fn load_dotenv(path: impl AsRef<Path>) {
    let path = path.as_ref();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

#[derive(Debug, Clone)]
pub struct AriSettings {
    pub base_url: String,
    pub ws_url: String,
    pub app_name: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GapGptSettings {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ViraSettings {
    pub stt_url: String,
    pub stt_token: String,
    pub tts_url: String,
    pub tts_token: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub extension: String,
    pub trunk: String,
    pub caller_id: String,
    pub timeout_secs: u64,
    pub endpoint: String,
    pub mobile_numbers: Vec<String>,
    pub use_panel_agents: bool,
}

#[derive(Debug, Clone)]
pub struct DialerSettings {
    pub outbound_trunk: String,
    pub outbound_numbers: Vec<String>,
    pub default_caller_id: String,
    pub origination_timeout_secs: u64,
    pub max_concurrent_calls: u32,
    pub max_concurrent_outbound_calls: u32,
    pub max_concurrent_inbound_calls: u32,
    pub max_calls_per_minute: u32,
    pub max_calls_per_day: u32,
    pub max_originations_per_second: f64,
    pub call_window_start: (u32, u32),
    pub call_window_end: (u32, u32),
    pub static_contacts: Vec<String>,
    pub batch_size: u32,
    pub default_retry_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ConcurrencySettings {
    pub max_parallel_stt: usize,
    pub max_parallel_tts: usize,
    pub max_parallel_llm: usize,
    pub http_max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub api_key: String,
    pub sender: String,
    pub admins: Vec<String>,
    pub fail_alert_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct PanelSettings {
    pub base_url: String,
    pub api_token: String,
    pub company: String,
    pub default_retry_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    pub dir: String,
    pub company: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ari: AriSettings,
    pub gapgpt: GapGptSettings,
    pub vira: ViraSettings,
    pub dialer: DialerSettings,
    pub operator: OperatorSettings,
    pub panel: PanelSettings,
    pub concurrency: ConcurrencySettings,
    pub sms: SmsSettings,
    pub scenario: ScenarioSettings,
    pub log_level: String,
}

impl Settings {
    /// Loads `.env` (if present) then builds the full settings tree from
    /// the process environment, applying the same defaults and
    /// fall-back-to-another-var behavior as `config/settings.py`.
    pub fn from_env() -> Result<Settings, ConfigError> {
        load_dotenv(".env");

        let ari = AriSettings {
            base_url: env_or("ARI_BASE_URL", "http://127.0.0.1:8088/ari"),
            ws_url: env_or("ARI_WS_URL", "ws://127.0.0.1:8088/ari/events"),
            app_name: env_or("ARI_APP_NAME", "dialer"),
            username: env_or("ARI_USERNAME", "dialer"),
            password: env_or("ARI_PASSWORD", "changeme"),
            timeout: Duration::from_secs_f64(env_parse("ARI_TIMEOUT", 10.0)),
        };

        let gapgpt = GapGptSettings {
            base_url: env_or("GAPGPT_BASE_URL", "https://api.gapgpt.app/v1"),
            api_key: env_or("GAPGPT_API_KEY", ""),
            timeout: Duration::from_secs_f64(env_parse("LLM_TIMEOUT", 20.0)),
        };

        let vira = ViraSettings {
            stt_url: env_or(
                "VIRA_STT_URL",
                "https://partai.gw.isahab.ir/avanegar/v2/avanegar/request",
            ),
            stt_token: env_or("VIRA_STT_TOKEN", ""),
            tts_url: env_or(
                "VIRA_TTS_URL",
                "https://partai.gw.isahab.ir/avasho/v2/avasho/request",
            ),
            tts_token: env_or("VIRA_TTS_TOKEN", ""),
            verify_ssl: !matches!(
                env_or("VIRA_VERIFY_SSL", "true").to_lowercase().as_str(),
                "0" | "false" | "no"
            ),
            timeout: Duration::from_secs_f64(env_parse("STT_TIMEOUT", 30.0)),
        };

        let max_concurrent_calls: u32 = env_parse("MAX_CONCURRENT_CALLS", 2);
        let default_caller_id = env_or("DEFAULT_CALLER_ID", "1000");
        let outbound_trunk = env_or("OUTBOUND_TRUNK", "TO-CUCM-Gaptel");

        let dialer = DialerSettings {
            outbound_trunk: outbound_trunk.clone(),
            outbound_numbers: parse_list(&env_or("OUTBOUND_NUMBERS", "")),
            default_caller_id: default_caller_id.clone(),
            origination_timeout_secs: env_parse("ORIGINATION_TIMEOUT", 30),
            max_concurrent_calls,
            max_concurrent_outbound_calls: env_parse(
                "MAX_CONCURRENT_OUTBOUND_CALLS",
                max_concurrent_calls,
            ),
            // 0 (the default, when unset) means "no additional global cap" —
            // inbound sessions still share each line's `max_concurrent_calls`
            // budget with outbound, just with no cross-line ceiling on top.
            max_concurrent_inbound_calls: env_parse("MAX_CONCURRENT_INBOUND_CALLS", 0),
            max_calls_per_minute: env_parse("MAX_CALLS_PER_MINUTE", 10),
            max_calls_per_day: env_parse("MAX_CALLS_PER_DAY", 200),
            max_originations_per_second: env_parse("MAX_ORIGINATIONS_PER_SECOND", 3.0),
            call_window_start: parse_time_of_day(&env_or("CALL_WINDOW_START", "00:00"), (0, 0)),
            call_window_end: parse_time_of_day(&env_or("CALL_WINDOW_END", "23:59"), (23, 59)),
            static_contacts: parse_list(&env_or("STATIC_CONTACTS", "")),
            batch_size: env_parse("DIALER_BATCH_SIZE", env_parse("MAX_CALLS_PER_MINUTE", 10u32)),
            default_retry_secs: env_parse("DIALER_DEFAULT_RETRY", 60),
        };

        let operator = OperatorSettings {
            extension: env_or("OPERATOR_EXTENSION", "200"),
            trunk: env_or("OPERATOR_TRUNK", &outbound_trunk),
            caller_id: env_or("OPERATOR_CALLER_ID", &default_caller_id),
            timeout_secs: env_parse("OPERATOR_TIMEOUT", 30),
            endpoint: env_or("OPERATOR_ENDPOINT", ""),
            mobile_numbers: parse_list(&env_or("OPERATOR_MOBILE_NUMBERS", "")),
            use_panel_agents: env_or("USE_PANEL_AGENTS", "false").to_lowercase() == "true",
        };

        let panel = PanelSettings {
            base_url: env_or("PANEL_BASE_URL", ""),
            api_token: env_or("PANEL_API_TOKEN", ""),
            company: env_or("COMPANY", ""),
            default_retry_secs: dialer.default_retry_secs,
        };

        let concurrency = ConcurrencySettings {
            max_parallel_stt: env_parse("MAX_PARALLEL_STT", 50),
            max_parallel_tts: env_parse("MAX_PARALLEL_TTS", 50),
            max_parallel_llm: env_parse("MAX_PARALLEL_LLM", 10),
            http_max_connections: env_parse("HTTP_MAX_CONNECTIONS", 100),
        };

        let sms = SmsSettings {
            api_key: env_or("SMS_API_KEY", ""),
            sender: env_or("SMS_FROM", ""),
            admins: parse_list(&env_or("SMS_ADMINS", "")),
            fail_alert_threshold: env_parse("FAIL_ALERT_THRESHOLD", 3),
        };

        let scenario = ScenarioSettings {
            dir: env_or("SCENARIO_DIR", "config/scenarios"),
            company: panel.company.clone(),
        };

        Ok(Settings {
            ari,
            gapgpt,
            vira,
            dialer,
            operator,
            panel,
            concurrency,
            sms,
            scenario,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

/// Metadata carried on a freshly-created outbound session, forwarded into
/// `Session::metadata` verbatim (mirrors `dialer.py`'s `_originate` payload).
pub fn attempt_metadata(
    number_id: Option<i64>,
    batch_id: Option<&str>,
    attempted_at: chrono::DateTime<chrono::Utc>,
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("attempted_at".to_string(), attempted_at.to_rfc3339());
    if let Some(id) = number_id {
        metadata.insert("number_id".to_string(), id.to_string());
    }
    if let Some(batch) = batch_id {
        metadata.insert("batch_id".to_string(), batch.to_string());
    }
    metadata
}
