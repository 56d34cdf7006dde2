use std::env;

use crate::protocol::RetryBudgets;

/// Process-wide configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL the engine forwards upstream requests to, e.g.
    /// `https://generativelanguage.googleapis.com`.
    pub upstream_url_base: String,
    /// Local TCP port the listener binds.
    pub port: u16,
    /// When false, the engine never logs request/response text at `debug!`.
    pub debug_mode: bool,
    /// Retry budgets per error class (spec.md §4.1).
    pub retry_budgets: RetryBudgets,
    /// Upstream statuses that never retry (spec.md §9 Open Question: exposed
    /// as configurable, default empty).
    pub fatal_status_codes: Vec<u16>,
    /// The thought-prelude string (`config.startOfThought` in spec.md §9) —
    /// its literal value is external configuration by design; ghost-loop
    /// remediation rewrites the model's last turn to exactly this string.
    pub thought_prelude: String,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Mirrors the teacher's `Config::from_env()`: a required value missing
    /// entirely is a startup failure (the process should not serve traffic
    /// without an upstream to forward to); malformed optional values fall
    /// back to documented defaults with a `tracing::warn!` rather than
    /// aborting startup.
    pub fn from_env() -> anyhow::Result<Self> {
        let upstream_url_base = env::var("UPSTREAM_URL_BASE")
            .map_err(|_| anyhow::anyhow!("UPSTREAM_URL_BASE must be set"))?;

        let port = parse_env_or_default("PORT", 8787);
        let max_retries = parse_env_or_default("MAX_RETRIES", 100);
        let max_fetch_retries = parse_env_or_default("MAX_FETCH_RETRIES", 3);
        let max_non_retryable_status_retries =
            parse_env_or_default("MAX_NON_RETRYABLE_STATUS_RETRIES", 3);

        let debug_mode = env::var("DEBUG_MODE")
            .ok()
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(true);

        let thought_prelude = env::var("THOUGHT_PRELUDE")
            .unwrap_or_else(|_| "Let's think through this step by step.".to_string());

        let fatal_status_codes = env::var("FATAL_STATUS_CODES")
            .ok()
            .map(|raw| parse_status_code_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            upstream_url_base,
            port,
            debug_mode,
            retry_budgets: RetryBudgets {
                max_retries,
                max_fetch_retries,
                max_non_retryable_status_retries,
            },
            fatal_status_codes,
            thought_prelude,
        })
    }
}

/// Parse a comma-separated list of HTTP status codes, skipping and warning
/// on any entry that does not parse as `u16`.
fn parse_status_code_list(raw: &str) -> Vec<u16> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<u16>() {
            Ok(code) => Some(code),
            Err(_) => {
                tracing::warn!(entry = s, "ignoring unparseable FATAL_STATUS_CODES entry");
                None
            }
        })
        .collect()
}

/// Parse an env var as `T`, falling back to `default` (and logging a warning)
/// if the var is absent or fails to parse.
fn parse_env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse env var, using default");
            default
        }),
        Err(_) => default,
    }
}
