// Best-effort classification of extractor error output into user-facing failures.
use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    AuthRequired,
    RateLimited,
    VideoUnavailable,
    AgeRestricted,
    ProxyError,
    GenericDownloadFailure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DownloadFailure {
    #[error("Authentication required: the site asked to sign in or solve a CAPTCHA. Configure a cookies file and try again.")]
    AuthRequired { detail: String },
    #[error("Rate limited: too many requests were sent to the site. Wait a few minutes and try again.")]
    RateLimited { detail: String },
    #[error("Video unavailable: it may be private, removed or blocked in this region.")]
    VideoUnavailable { detail: String },
    #[error("Age-restricted video: a signed-in cookies file is required to download it.")]
    AgeRestricted { detail: String },
    #[error("Proxy or connection failure: check the proxy settings and network connectivity.")]
    ProxyError { detail: String },
    #[error("Download failed: {detail}")]
    Generic { detail: String },
    #[error("Download cancelled.")]
    Cancelled,
}

impl DownloadFailure {
    pub(crate) fn generic(detail: impl Into<String>) -> Self {
        Self::Generic {
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AuthRequired { .. } => FailureKind::AuthRequired,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::VideoUnavailable { .. } => FailureKind::VideoUnavailable,
            Self::AgeRestricted { .. } => FailureKind::AgeRestricted,
            Self::ProxyError { .. } => FailureKind::ProxyError,
            Self::Generic { .. } => FailureKind::GenericDownloadFailure,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub(crate) fn detail(&self) -> &str {
        match self {
            Self::AuthRequired { detail }
            | Self::RateLimited { detail }
            | Self::VideoUnavailable { detail }
            | Self::AgeRestricted { detail }
            | Self::ProxyError { detail }
            | Self::Generic { detail } => detail,
            Self::Cancelled => "",
        }
    }
}

// Checked in order; age checks precede auth because YouTube phrases age gates
// as "Sign in to confirm your age".
const AGE_PATTERNS: [&str; 4] = [
    "confirm your age",
    "age-restricted",
    "age restricted",
    "inappropriate for some users",
];
const AUTH_PATTERNS: [&str; 6] = [
    "sign in to confirm",
    "not a bot",
    "captcha",
    "login required",
    "use --cookies",
    "authentication",
];
const RATE_LIMIT_PATTERNS: [&str; 4] = [
    "http error 429",
    "too many requests",
    "rate limit",
    "rate-limit",
];
const UNAVAILABLE_PATTERNS: [&str; 6] = [
    "video unavailable",
    "this video is unavailable",
    "private video",
    "has been removed",
    "http error 404",
    "blocking this download",
];
const PROXY_PATTERNS: [&str; 7] = [
    "proxyerror",
    "unable to connect to proxy",
    "tunnel connection failed",
    "proxy",
    "connection refused",
    "timed out",
    "name or service not known",
];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| haystack.contains(pattern))
}

pub(crate) fn classify_failure(raw: &str) -> DownloadFailure {
    let detail = raw.trim().to_string();
    let lowered = detail.to_lowercase();
    if matches_any(&lowered, &AGE_PATTERNS) {
        return DownloadFailure::AgeRestricted { detail };
    }
    if matches_any(&lowered, &AUTH_PATTERNS) {
        return DownloadFailure::AuthRequired { detail };
    }
    if matches_any(&lowered, &RATE_LIMIT_PATTERNS) {
        return DownloadFailure::RateLimited { detail };
    }
    if matches_any(&lowered, &UNAVAILABLE_PATTERNS) {
        return DownloadFailure::VideoUnavailable { detail };
    }
    if matches_any(&lowered, &PROXY_PATTERNS) {
        return DownloadFailure::ProxyError { detail };
    }
    if detail.is_empty() {
        return DownloadFailure::generic("the extractor exited without an error message");
    }
    DownloadFailure::Generic { detail }
}
