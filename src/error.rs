use thiserror::Error;

/// Errors arising while dispatching one upstream attempt.
///
/// Per spec.md §7, none of these ever propagate to the client as an HTTP
/// error for sentinel-protocol requests — the retry controller always
/// resolves them to either a success terminal event or an incomplete-marker
/// terminal event. They surface only for the out-of-scope bypass paths
/// (structured-output / non-allow-listed models), where the upstream
/// response — including its status — is relayed verbatim.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("network error talking to upstream: {0}")]
    Network(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("failed to decode upstream event: {0}")]
    Decode(String),

    #[error("request body is malformed: {0}")]
    MalformedBody(String),

    #[error("{0}")]
    Other(String),
}

/// The retry-budget class an error belongs to, per spec.md §4.1/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried (`FATAL_STATUS_CODES`; empty by default).
    Fatal,
    /// {403, 429, 500, 503}, or 400 whose body mentions an API-key/location
    /// problem — retried up to `max_retries`.
    Retryable,
    /// Any other non-success HTTP status — retried up to
    /// `max_non_retryable_status_retries`.
    NonRetryableStatus,
    /// Transport-level failure (connect/reset/timeout before headers) —
    /// retried up to `max_fetch_retries`.
    Network,
}

impl ProxyError {
    /// Classify this error into a retry-budget bucket. `fatal_status_codes`
    /// comes from `Config` (spec.md §9 open question: exposed as
    /// configurable, current default empty).
    pub fn classify(&self, fatal_status_codes: &[u16]) -> ErrorClass {
        match self {
            ProxyError::Network(_) => ErrorClass::Network,
            ProxyError::UpstreamStatus { status, body } => {
                if fatal_status_codes.contains(status) {
                    ErrorClass::Fatal
                } else if crate::protocol::RETRYABLE_STATUSES.contains(status)
                    || (*status == 400 && is_effectively_retryable_400(body))
                {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::NonRetryableStatus
                }
            }
            ProxyError::Decode(_) | ProxyError::MalformedBody(_) | ProxyError::Other(_) => {
                ErrorClass::NonRetryableStatus
            }
        }
    }

    /// Sanitized message safe to log or fold into the incomplete-marker
    /// text; never includes upstream URLs or raw connection detail.
    pub fn user_message(&self) -> String {
        match self {
            ProxyError::Network(_) => "network error contacting upstream".to_string(),
            ProxyError::UpstreamStatus { status, .. } => format!("upstream returned {status}"),
            ProxyError::Decode(_) => "failed to decode upstream stream".to_string(),
            ProxyError::MalformedBody(_) => "request body could not be processed".to_string(),
            ProxyError::Other(_) => "an error occurred".to_string(),
        }
    }
}

/// A 400 is "effectively retryable" when the body indicates a transient
/// upstream-side condition rather than a genuinely malformed request.
fn is_effectively_retryable_400(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("api key") || lower.contains("user location")
}
