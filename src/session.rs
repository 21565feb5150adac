//! Session registrar: enforces the at-most-one-in-flight download policy and
//! serves consistent status snapshots.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use chrono::Utc;
use log::info;

use upgrade_api::config::DownloadConfig;

use crate::download::{
    self,
    error::DownloadError,
    session::{DownloadSession, SharedSession},
    DownloadOptions,
};

/// Per-request overrides for the configured download defaults.
#[derive(Debug, Default, Clone)]
pub struct DownloadOverrides {
    pub connect_timeout_seconds: Option<u64>,
    pub total_timeout_seconds: Option<u64>,
    pub expected_md5: Option<String>,
}

/// The single slot of in-flight download state shared across requests.
#[derive(Clone)]
pub struct ActiveDownload {
    pub id: String,
    pub session: SharedSession,
    pub done: Arc<AtomicBool>,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("download already in progress")]
    Conflict,
    #[error("{0}")]
    Download(DownloadError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("No download session exists")]
    NoSession,
    #[error("Session id '{requested}' does not match the active session '{active}'")]
    Mismatch { requested: String, active: String },
}

/// Returned synchronously by Start; the transfer continues in the background.
#[derive(Debug, Clone)]
pub struct StartReceipt {
    pub session_id: String,
    pub status: &'static str,
    pub output_path: PathBuf,
}

/// Point-in-time view of the active session.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub session: DownloadSession,
    pub done: bool,
}

pub struct DownloadManager {
    slot: RwLock<Option<ActiveDownload>>,
    last_id: Mutex<i64>,
    config: DownloadConfig,
    download_dir: PathBuf,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, download_dir: PathBuf) -> Self {
        Self {
            slot: RwLock::new(None),
            last_id: Mutex::new(0),
            config,
            download_dir,
        }
    }

    /// Installs a new session and spawns the engine for it, unless a download
    /// is already in flight. Returns immediately; callers observe the
    /// transfer through `status`.
    pub fn start(
        &self,
        url: &str,
        output_path: &str,
        overrides: DownloadOverrides,
    ) -> Result<StartReceipt, StartError> {
        if url.trim().is_empty() {
            return Err(StartError::EmptyUrl);
        }

        let mut slot = self.slot.write().unwrap();
        if let Some(active) = slot.as_ref() {
            if !active.done.load(Ordering::Acquire) {
                return Err(StartError::Conflict);
            }
        }

        let resolved = download::derive_output_path(url, output_path, &self.download_dir)
            .map_err(StartError::Download)?;
        download::ensure_parent_dir(&resolved, url).map_err(StartError::Download)?;

        let id = self.next_id();
        let session = DownloadSession::new(id.clone(), url, resolved.clone()).shared();
        let done = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));

        // Displaces any previous, completed session.
        *slot = Some(ActiveDownload {
            id: id.clone(),
            session: session.clone(),
            done: done.clone(),
            cancel: cancel.clone(),
        });
        drop(slot);

        info!(
            "Starting download session {id}: {url} -> '{}'",
            resolved.display()
        );

        let options = self.options_for(&overrides);
        let engine_session = session;
        let engine_cancel = cancel;
        std::thread::spawn(move || {
            let _ = download::run(&engine_session, &options, &engine_cancel);
            done.store(true, Ordering::Release);
        });

        Ok(StartReceipt {
            session_id: id,
            status: "starting",
            output_path: resolved,
        })
    }

    /// Snapshot of the active session, by id.
    pub fn status(&self, session_id: &str) -> Result<StatusSnapshot, StatusError> {
        let slot = self.slot.read().unwrap();
        let active = slot.as_ref().ok_or(StatusError::NoSession)?;
        if active.id != session_id {
            return Err(StatusError::Mismatch {
                requested: session_id.to_string(),
                active: active.id.clone(),
            });
        }
        let snapshot = StatusSnapshot {
            session: active.session.lock().unwrap().clone(),
            done: active.done.load(Ordering::Acquire),
        };
        Ok(snapshot)
    }

    /// Signals the in-flight download, if any, to stop.
    pub fn shutdown(&self) {
        if let Some(active) = self.slot.read().unwrap().as_ref() {
            active.cancel.store(true, Ordering::Release);
        }
    }

    fn options_for(&self, overrides: &DownloadOverrides) -> DownloadOptions {
        let mut options = DownloadOptions::from_config(&self.config);
        if let Some(secs) = overrides.connect_timeout_seconds {
            options.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.total_timeout_seconds {
            options.total_timeout = Duration::from_secs(secs);
        }
        options.expected_md5 = overrides.expected_md5.clone();
        options
    }

    /// Session ids derive from the start time and are strictly monotonic,
    /// even for starts within the same millisecond.
    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_id.lock().unwrap();
        *last = now.max(*last + 1);
        last.to_string()
    }
}
