use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use strum_macros::IntoStaticStr;

use super::error::DownloadError;

/// Transport binding the engine is using for the current attempt. The ladder
/// moves through the variants in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadMethod {
    /// Bound to the preferred interface's primary address.
    Interface,
    /// Bound to one specific address of the preferred interface.
    Ip,
    /// No local binding.
    Direct,
}

impl std::fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Starting,
    Downloading,
    Completed,
    Failed,
}

/// One failed transport attempt, recorded as the ladder progresses.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub method: DownloadMethod,
    /// Local address the attempt was bound to, empty for direct.
    pub binding: String,
    pub error_message: String,
    pub duration: Duration,
    pub http_status: Option<u16>,
}

/// Final record of a successful download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub duration: Duration,
    pub attempt_count: u32,
    pub final_method: DownloadMethod,
    pub url: String,
    /// Digest confirmation when validation was requested.
    pub checksum_validation: Option<String>,
}

/// Server-side record of one firmware download. Mutated only by the engine;
/// readers clone a consistent snapshot under the session lock.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: String,
    pub url: String,
    pub output_path: PathBuf,
    pub downloaded_bytes: u64,
    /// Zero when the server omitted Content-Length.
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub state: DownloadState,
    pub current_method: DownloadMethod,
    pub attempt_count: u32,
    pub attempts: Vec<Attempt>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub error: Option<DownloadError>,
    pub outcome: Option<DownloadOutcome>,
}

pub type SharedSession = Arc<Mutex<DownloadSession>>;

impl DownloadSession {
    pub fn new(id: impl Into<String>, url: impl Into<String>, output_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            output_path,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bytes_per_sec: 0,
            state: DownloadState::Starting,
            current_method: DownloadMethod::Interface,
            attempt_count: 0,
            attempts: Vec::new(),
            start_time: now,
            last_update: now,
            error: None,
            outcome: None,
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Transfer completion in percent; zero when the total is unknown.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let session = DownloadSession::new(
            "1700000000000",
            "http://198.51.100.7/fw.bin",
            PathBuf::from("/tmp/firmware/fw.bin"),
        );
        assert_eq!(session.state, DownloadState::Starting);
        assert_eq!(session.attempt_count, 0);
        assert!(session.error.is_none() && session.outcome.is_none());
        assert_eq!(session.last_update, session.start_time);
    }

    #[test]
    fn test_percentage() {
        let mut session =
            DownloadSession::new("1", "http://example.invalid/fw.bin", PathBuf::new());
        assert_eq!(session.percentage(), 0.0);

        session.total_bytes = 200;
        session.downloaded_bytes = 50;
        assert_eq!(session.percentage(), 25.0);
    }

    #[test]
    fn test_method_strings() {
        assert_eq!(DownloadMethod::Interface.to_string(), "interface");
        assert_eq!(DownloadMethod::Ip.to_string(), "ip");
        assert_eq!(DownloadMethod::Direct.to_string(), "direct");
    }
}
