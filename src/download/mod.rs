//! Firmware download engine: a three-rung transport ladder with progress
//! accounting, error classification and optional integrity validation.

use std::{
    fs::File,
    io::{Read, Write},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use reqwest::Url;

use upgrade_api::config::DownloadConfig;

pub mod error;
pub mod netif;
pub mod session;

use error::{classify_reqwest, error_chain, DownloadError, ErrorCategory};
use session::{Attempt, DownloadMethod, DownloadOutcome, DownloadState, SharedSession};

/// Body streaming chunk size.
const TRANSFER_CHUNK: usize = 32 * 1024;

/// Minimum interval between progress snapshots.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Mode for created parent directories.
const OUTPUT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub expected_md5: Option<String>,
    pub preferred_interface: String,
    pub max_fallback_attempts: u32,
    pub user_agent: String,
}

impl DownloadOptions {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            total_timeout: Duration::from_secs(config.total_timeout_seconds),
            expected_md5: None,
            preferred_interface: config.preferred_interface.clone(),
            max_fallback_attempts: config.max_fallback_attempts,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Picks the destination file: the caller's path when given, otherwise the
/// URL's final segment under `default_dir`. URLs without a usable filename
/// are rejected with a filesystem-category error.
pub fn derive_output_path(
    url_str: &str,
    requested: &str,
    default_dir: &Path,
) -> Result<PathBuf, DownloadError> {
    if !requested.is_empty() {
        let path = PathBuf::from(requested);
        return Ok(if path.is_absolute() {
            path
        } else {
            default_dir.join(path)
        });
    }

    let url = Url::parse(url_str).map_err(|e| {
        DownloadError::new(ErrorCategory::Other, format!("Invalid URL: {e}"), url_str)
    })?;
    let filename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| {
            DownloadError::new(
                ErrorCategory::Filesystem,
                "URL has no usable filename; specify an output path",
                url_str,
            )
        })?;
    Ok(default_dir.join(filename))
}

/// Creates the destination's parent directory.
pub fn ensure_parent_dir(path: &Path, url: &str) -> Result<(), DownloadError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    hostutils::files::create_dirs_mode(parent, OUTPUT_DIR_MODE)
        .map_err(|e| DownloadError::new(ErrorCategory::Filesystem, format!("{e:#}"), url))
}

/// Runs the download to completion, mutating `session` along the way. The
/// terminal state is recorded in the session before this returns.
pub fn run(
    session: &SharedSession,
    options: &DownloadOptions,
    cancel: &Arc<AtomicBool>,
) -> Result<DownloadOutcome, DownloadError> {
    let (url_str, output_path) = {
        let s = session.lock().unwrap();
        (s.url.clone(), s.output_path.clone())
    };

    let overall = Instant::now();
    let result = run_ladder(session, options, cancel, &url_str, &output_path, overall);

    let mut s = session.lock().unwrap();
    s.last_update = Utc::now();
    match &result {
        Ok(outcome) => {
            info!(
                "Download session {} completed: {} bytes via {} in {:.1}s",
                s.id,
                outcome.size_bytes,
                outcome.final_method,
                outcome.duration.as_secs_f32()
            );
            s.state = DownloadState::Completed;
            s.downloaded_bytes = outcome.size_bytes;
            s.outcome = Some(outcome.clone());
        }
        Err(e) => {
            warn!("Download session {} failed: {e}", s.id);
            s.state = DownloadState::Failed;
            s.error = Some(e.clone());
        }
    }
    result
}

/// One rung of the strategy ladder.
enum Rung {
    Interface,
    PerAddress,
    Direct,
}

struct Binding {
    method: DownloadMethod,
    local: Option<IpAddr>,
}

impl Binding {
    fn label(&self) -> String {
        self.local.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

fn run_ladder(
    session: &SharedSession,
    options: &DownloadOptions,
    cancel: &Arc<AtomicBool>,
    url_str: &str,
    output_path: &Path,
    overall: Instant,
) -> Result<DownloadOutcome, DownloadError> {
    let url = Url::parse(url_str).map_err(|e| {
        DownloadError::new(ErrorCategory::Other, format!("Invalid URL: {e}"), url_str)
    })?;

    let mut attempts: Vec<Attempt> = Vec::new();
    let mut last_error: Option<String> = None;

    'ladder: for rung in [Rung::Interface, Rung::PerAddress, Rung::Direct] {
        let bindings = match rung {
            Rung::Interface => {
                match netif::operstate(&options.preferred_interface) {
                    Ok(state) if state == "up" => {}
                    Ok(state) => {
                        debug!(
                            "Interface '{}' is {state}; skipping interface-bound strategy",
                            options.preferred_interface
                        );
                        continue 'ladder;
                    }
                    Err(e) => {
                        debug!(
                            "Cannot read operstate of '{}' ({e:#}); skipping interface-bound strategy",
                            options.preferred_interface
                        );
                        continue 'ladder;
                    }
                }
                match primary_interface_address(&options.preferred_interface) {
                    Some(ip) => vec![Binding {
                        method: DownloadMethod::Interface,
                        local: Some(ip),
                    }],
                    None => {
                        // The interface is up but unusable; that is an
                        // attempt in its own right, and a network one.
                        let message = format!(
                            "No usable address on interface '{}'",
                            options.preferred_interface
                        );
                        record_attempt(
                            session,
                            &mut attempts,
                            Attempt {
                                method: DownloadMethod::Interface,
                                binding: String::new(),
                                error_message: message.clone(),
                                duration: Duration::ZERO,
                                http_status: None,
                            },
                        );
                        last_error = Some(message);
                        continue 'ladder;
                    }
                }
            }
            Rung::PerAddress => per_address_bindings(&url, &options.preferred_interface),
            Rung::Direct => vec![Binding {
                method: DownloadMethod::Direct,
                local: None,
            }],
        };

        for binding in bindings {
            if attempts.len() as u32 >= options.max_fallback_attempts {
                debug!("Fallback attempt limit reached");
                break 'ladder;
            }

            {
                let mut s = session.lock().unwrap();
                s.current_method = binding.method;
                s.attempt_count = attempts.len() as u32 + 1;
                s.last_update = Utc::now();
            }
            debug!(
                "Attempt {} via {}{}",
                attempts.len() + 1,
                binding.method,
                binding
                    .local
                    .map(|ip| format!(" (bound to {ip})"))
                    .unwrap_or_default()
            );

            let attempt_started = Instant::now();
            match transfer(&url, &binding, options, session, cancel, output_path) {
                Ok(size_bytes) => {
                    let checksum_validation = match options.expected_md5.as_deref() {
                        Some(expected) if !expected.is_empty() => {
                            match verify_md5(output_path, expected) {
                                Ok(digest) => Some(format!("md5:{digest}")),
                                Err(message) => {
                                    // The file is retained for inspection.
                                    return Err(DownloadError::new(
                                        ErrorCategory::Validation,
                                        message,
                                        url_str,
                                    )
                                    .with_attempts(attempts));
                                }
                            }
                        }
                        _ => None,
                    };

                    return Ok(DownloadOutcome {
                        file_path: output_path.to_path_buf(),
                        size_bytes,
                        duration: overall.elapsed(),
                        attempt_count: attempts.len() as u32 + 1,
                        final_method: binding.method,
                        url: url_str.to_string(),
                        checksum_validation,
                    });
                }
                Err((category, message)) => {
                    warn!(
                        "Attempt via {} failed ({}): {message}",
                        binding.method, category
                    );
                    record_attempt(
                        session,
                        &mut attempts,
                        Attempt {
                            method: binding.method,
                            binding: binding.label(),
                            error_message: message.clone(),
                            duration: attempt_started.elapsed(),
                            http_status: category.http_code(),
                        },
                    );
                    // Only network-class failures may fall through to the
                    // next binding or strategy.
                    if !category.is_network() {
                        return Err(DownloadError::new(category, message, url_str)
                            .with_attempts(attempts));
                    }
                    last_error = Some(message);
                }
            }
        }
    }

    Err(DownloadError::new(
        ErrorCategory::Network,
        last_error.unwrap_or_else(|| "All download strategies failed".to_string()),
        url_str,
    )
    .with_attempts(attempts))
}

fn record_attempt(session: &SharedSession, attempts: &mut Vec<Attempt>, attempt: Attempt) {
    attempts.push(attempt);
    let mut s = session.lock().unwrap();
    s.attempts = attempts.clone();
    s.last_update = Utc::now();
}

/// First IPv4 address on the interface, or failing that the first
/// non-link-local IPv6.
fn primary_interface_address(interface: &str) -> Option<IpAddr> {
    let addrs = netif::addresses(interface).ok()?;
    if let Some(v4) = addrs.v4.first() {
        return Some(IpAddr::V4(*v4));
    }
    addrs
        .v6
        .iter()
        .find(|addr| !netif::is_link_local(addr))
        .map(|addr| IpAddr::V6(*addr))
}

/// Candidate bindings for the per-address rung, chosen to match the URL
/// host's address family; hostnames prefer IPv4 and then try IPv6.
fn per_address_bindings(url: &Url, interface: &str) -> Vec<Binding> {
    let addrs = netif::addresses(interface).unwrap_or_default();
    let ips: Vec<IpAddr> = match url.host() {
        Some(url::Host::Ipv4(_)) => addrs.v4.into_iter().map(IpAddr::V4).collect(),
        Some(url::Host::Ipv6(_)) => addrs.v6.into_iter().map(IpAddr::V6).collect(),
        _ => addrs
            .v4
            .into_iter()
            .map(IpAddr::V4)
            .chain(addrs.v6.into_iter().map(IpAddr::V6))
            .collect(),
    };
    ips.into_iter()
        .map(|ip| Binding {
            method: DownloadMethod::Ip,
            local: Some(ip),
        })
        .collect()
}

/// Performs one HTTP GET attempt, streaming the body to the output file and
/// publishing progress. Returns the byte count on success, or the failure
/// category and message.
fn transfer(
    url: &Url,
    binding: &Binding,
    options: &DownloadOptions,
    session: &SharedSession,
    cancel: &Arc<AtomicBool>,
    output_path: &Path,
) -> Result<u64, (ErrorCategory, String)> {
    let mut builder = reqwest::blocking::Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.total_timeout);
    if !options.user_agent.is_empty() {
        builder = builder.user_agent(options.user_agent.clone());
    }
    if let Some(ip) = binding.local {
        builder = builder.local_address(ip);
    }
    let client = builder.build().map_err(|e| {
        (
            classify_reqwest(&e),
            format!("Failed to build HTTP client: {}", error_chain(&e)),
        )
    })?;

    let mut response = client
        .get(url.clone())
        .send()
        .map_err(|e| (classify_reqwest(&e), error_chain(&e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err((
            ErrorCategory::Http(status.as_u16()),
            format!("HTTP status {status}"),
        ));
    }

    let total_bytes = response.content_length().unwrap_or(0);
    {
        let mut s = session.lock().unwrap();
        s.state = DownloadState::Downloading;
        s.total_bytes = total_bytes;
        s.last_update = Utc::now();
    }

    let mut file = File::create(output_path).map_err(|e| {
        (
            ErrorCategory::Filesystem,
            format!("Failed to create '{}': {e}", output_path.display()),
        )
    })?;

    let transfer_started = Instant::now();
    let mut last_publish = Instant::now();
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; TRANSFER_CHUNK];

    loop {
        if cancel.load(Ordering::Acquire) {
            return Err((ErrorCategory::Other, "Download cancelled".to_string()));
        }

        let n = response
            .read(&mut buffer)
            .map_err(|e| (ErrorCategory::Network, format!("Failed to read response body: {e}")))?;
        if n == 0 {
            break;
        }

        if let Err(e) = file.write_all(&buffer[..n]) {
            drop(file);
            let _ = std::fs::remove_file(output_path);
            return Err((
                ErrorCategory::Filesystem,
                format!("Failed to write '{}': {e}", output_path.display()),
            ));
        }
        downloaded += n as u64;

        if last_publish.elapsed() >= PROGRESS_INTERVAL {
            publish_progress(session, downloaded, total_bytes, transfer_started);
            last_publish = Instant::now();
        }
    }

    publish_progress(session, downloaded, total_bytes, transfer_started);
    Ok(downloaded)
}

/// Atomically updates the session's progress figures. Speed is the cumulative
/// average over the transfer so far.
fn publish_progress(session: &SharedSession, downloaded: u64, total: u64, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        (downloaded as f64 / elapsed) as u64
    } else {
        0
    };

    let mut s = session.lock().unwrap();
    s.downloaded_bytes = downloaded;
    s.total_bytes = total;
    s.speed_bytes_per_sec = speed;
    s.last_update = Utc::now();
}

/// Streams the finished file through MD5 and compares case-insensitively.
/// Returns the computed digest, or the mismatch message.
fn verify_md5(path: &Path, expected: &str) -> Result<String, String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => return Err(format!("Failed to open '{}': {e}", path.display())),
    };

    let mut hasher = Md5::new();
    let mut buffer = [0u8; TRANSFER_CHUNK];
    loop {
        let n = match file.read(&mut buffer) {
            Ok(n) => n,
            Err(e) => return Err(format!("Failed to read '{}': {e}", path.display())),
        };
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest = format!("{:x}", hasher.finalize());
    if digest.eq_ignore_ascii_case(expected) {
        Ok(digest)
    } else {
        Err(format!(
            "Checksum mismatch: expected MD5 {expected}, computed {digest}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::session::DownloadSession;
    use super::*;

    fn test_options() -> DownloadOptions {
        DownloadOptions {
            connect_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(30),
            expected_md5: None,
            // Not a real interface; the ladder falls through to direct.
            preferred_interface: "testnull0".to_string(),
            max_fallback_attempts: 10,
            user_agent: "sonic-upgraded-test".to_string(),
        }
    }

    fn new_session(url: &str, output: PathBuf) -> SharedSession {
        DownloadSession::new("1700000000000", url, output).shared()
    }

    #[test]
    fn test_derive_output_path() {
        let dir = Path::new("/tmp/firmware");

        assert_eq!(
            derive_output_path("http://198.51.100.7/images/fw.bin", "", dir).unwrap(),
            Path::new("/tmp/firmware/fw.bin")
        );
        assert_eq!(
            derive_output_path("http://198.51.100.7/fw.bin", "/data/out.bin", dir).unwrap(),
            Path::new("/data/out.bin")
        );
        assert_eq!(
            derive_output_path("http://198.51.100.7/fw.bin", "out.bin", dir).unwrap(),
            Path::new("/tmp/firmware/out.bin")
        );

        let err = derive_output_path("http://198.51.100.7/", "", dir).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Filesystem);

        let err = derive_output_path("not a url", "", dir).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Other);
    }

    #[test]
    fn test_happy_path_direct() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/firmware.bin")
            .with_body("test firmware")
            .create();

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("firmware.bin");
        let url = format!("{}/firmware.bin", server.url());
        let session = new_session(&url, output.clone());

        let outcome = run(&session, &test_options(), &Arc::new(AtomicBool::new(false))).unwrap();
        mock.assert();

        assert_eq!(outcome.size_bytes, 13);
        assert_eq!(outcome.final_method, DownloadMethod::Direct);
        assert!(outcome.attempt_count >= 1);
        assert_eq!(std::fs::read(&output).unwrap(), b"test firmware");

        let s = session.lock().unwrap();
        assert_eq!(s.state, DownloadState::Completed);
        assert_eq!(s.downloaded_bytes, 13);
        assert!(s.outcome.is_some());
    }

    #[test]
    fn test_http_404_is_terminal() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/missing.bin", server.url());
        let session = new_session(&url, dir.path().join("missing.bin"));

        let err = run(&session, &test_options(), &Arc::new(AtomicBool::new(false))).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Http(404));
        assert_eq!(err.attempts.len(), 1);
        assert_eq!(err.attempts[0].http_status, Some(404));

        let s = session.lock().unwrap();
        assert_eq!(s.state, DownloadState::Failed);
    }

    #[test]
    fn test_connection_refused_exhausts_ladder_as_network() {
        // Bind and immediately drop a listener to find a dead port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let url = format!("http://127.0.0.1:{port}/fw.bin");
        let session = new_session(&url, dir.path().join("fw.bin"));

        let err = run(&session, &test_options(), &Arc::new(AtomicBool::new(false))).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(!err.attempts.is_empty());
    }

    #[test]
    fn test_md5_validation_success_and_mismatch() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/fw.bin")
            .with_body("test firmware")
            .expect_at_least(2)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/fw.bin", server.url());

        // printf 'test firmware' | md5sum, uppercased to cover the
        // case-insensitive comparison.
        let mut options = test_options();
        options.expected_md5 = Some("F5DF576754A50780ABD23FF42C1ED1B4".to_string());
        let session = new_session(&url, dir.path().join("fw.bin"));
        let outcome = run(&session, &options, &Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(
            outcome.checksum_validation.as_deref(),
            Some("md5:f5df576754a50780abd23ff42c1ed1b4")
        );

        options.expected_md5 = Some("00000000000000000000000000000000".to_string());
        let session = new_session(&url, dir.path().join("fw2.bin"));
        let err = run(&session, &options, &Arc::new(AtomicBool::new(false))).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        // The mismatched file is retained for inspection.
        assert!(dir.path().join("fw2.bin").exists());
    }

    #[test]
    fn test_cancellation_is_terminal() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/fw.bin").with_body("payload").create();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/fw.bin", server.url());
        let session = new_session(&url, dir.path().join("fw.bin"));

        let cancel = Arc::new(AtomicBool::new(true));
        let err = run(&session, &test_options(), &cancel).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Other);
        assert!(err.message.contains("cancelled"));
    }

    #[test]
    fn test_unwritable_output_is_filesystem_error() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/fw.bin").with_body("payload").create();

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        if File::create(locked.join("probe")).is_ok() {
            // Running as root; permission bits are not enforced.
            return;
        }

        let url = format!("{}/fw.bin", server.url());
        let session = new_session(&url, locked.join("fw.bin"));
        let err = run(&session, &test_options(), &Arc::new(AtomicBool::new(false))).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Filesystem);
    }

    #[test]
    fn test_progress_reported_without_content_length() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/fw.bin")
            .with_chunked_body(|writer| writer.write_all(b"streamed body"))
            .create();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/fw.bin", server.url());
        let session = new_session(&url, dir.path().join("fw.bin"));

        run(&session, &test_options(), &Arc::new(AtomicBool::new(false))).unwrap();
        let s = session.lock().unwrap();
        assert_eq!(s.total_bytes, 0);
        assert_eq!(s.downloaded_bytes, 13);
        assert_eq!(s.percentage(), 0.0);
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/fw.bin");
        ensure_parent_dir(&path, "http://198.51.100.7/fw.bin").unwrap();
        assert!(dir.path().join("nested/out").is_dir());
    }
}
