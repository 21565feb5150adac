use super::session::Attempt;

/// User-visible error category. Only NETWORK-class errors let the strategy
/// ladder advance; every other category is terminal for the download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Http(u16),
    Filesystem,
    Validation,
    Other,
}

impl ErrorCategory {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Http(_) => "http",
            Self::Filesystem => "filesystem",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }

    pub fn http_code(&self) -> Option<u16> {
        match self {
            Self::Http(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(code) => write!(f, "http({code})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Terminal error of a download session, carrying the full attempt history.
#[derive(Debug, Clone)]
pub struct DownloadError {
    pub category: ErrorCategory,
    pub message: String,
    pub url: String,
    pub attempts: Vec<Attempt>,
}

impl DownloadError {
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            url: url.into(),
            attempts: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<Attempt>) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.category, self.message, self.url)
    }
}

impl std::error::Error for DownloadError {}

const NETWORK_MARKERS: &[&str] = &[
    "connection",
    "connect",
    "timed out",
    "timeout",
    "dial",
    "refused",
    "reset",
    "dns",
    "resolve",
    "lookup",
    "unreachable",
    "no route",
    "broken pipe",
    "interface",
    "bind",
];

const FILESYSTEM_MARKERS: &[&str] = &[
    "create",
    "write",
    "permission",
    "space",
    "read-only",
    "directory",
];

/// Classifies an error message by substring, the same buckets the RPC surface
/// reports.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    if NETWORK_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorCategory::Network;
    }
    if FILESYSTEM_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorCategory::Filesystem;
    }
    ErrorCategory::Other
}

/// Classifies a transport error, preferring reqwest's own taxonomy before
/// falling back to message substrings across the source chain.
pub fn classify_reqwest(error: &reqwest::Error) -> ErrorCategory {
    if error.is_timeout() || error.is_connect() {
        return ErrorCategory::Network;
    }
    classify_message(&error_chain(error))
}

/// Renders an error and all of its sources into one line.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
