//! RPC façade: binds the upgrade operations to the wire format and maps
//! errors onto transport status codes.

use std::{path::PathBuf, sync::Arc};

use log::info;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status};

use hostutils::{
    cleanup,
    hostpath::{self, HostPaths},
    installer::SonicInstaller,
    registry::{self, ImageRegistry},
};
use upgrade_api::config::ConfigFile;
use upgrade_api::error::{
    ErrorKind, InvalidRequestError, ReportError, ServicingError, UpgradeError,
};

use crate::{
    consolidate,
    download::session::DownloadState,
    session::{DownloadManager, DownloadOverrides, StartError, StatusError},
};

pub mod proto {
    tonic::include_proto!("sonic.upgrade");
}

pub use proto::upgrade_server::UpgradeServer;
use proto::upgrade_server::Upgrade;

/// Immutable service-wide state shared by every request handler.
pub struct ServiceState {
    pub config: ConfigFile,
    pub host_paths: HostPaths,
    pub manager: DownloadManager,
    pub installer: SonicInstaller,
}

impl ServiceState {
    pub fn new(config: ConfigFile) -> Self {
        let host_paths = HostPaths::new(&config.service.path_prefix);
        let download_dir = hostpath::resolve(
            &config.service.path_prefix,
            &config.firmware.download_dir,
        );
        let manager = DownloadManager::new(config.download.clone(), download_dir);
        Self {
            host_paths,
            manager,
            installer: SonicInstaller::new(),
            config,
        }
    }

    /// Directories to scan, all routed through the path resolver: configured
    /// defaults when the caller named none, the caller's otherwise.
    fn search_dirs(&self, requested: &[String]) -> Vec<PathBuf> {
        let prefix = &self.config.service.path_prefix;
        if requested.is_empty() {
            return self
                .config
                .firmware
                .search_dirs
                .iter()
                .map(|dir| hostpath::resolve(prefix, dir))
                .collect();
        }
        requested
            .iter()
            .map(|dir| hostpath::resolve(prefix, dir))
            .collect()
    }
}

pub struct UpgradeService {
    state: Arc<ServiceState>,
}

impl UpgradeService {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }
}

fn to_status(error: UpgradeError) -> Status {
    match error.kind() {
        ErrorKind::InvalidRequest(InvalidRequestError::NoSession) => {
            Status::not_found(error.status_message())
        }
        ErrorKind::InvalidRequest(_) => Status::invalid_argument(error.status_message()),
        ErrorKind::Servicing(ServicingError::DownloadInProgress) => {
            Status::failed_precondition(error.status_message())
        }
        _ => Status::internal(format!("{}: {}", error.category(), error.status_message())),
    }
}

fn join_error(error: tokio::task::JoinError) -> Status {
    Status::internal(format!("Background task failed: {error}"))
}

#[tonic::async_trait]
impl Upgrade for UpgradeService {
    async fn download_firmware(
        &self,
        request: Request<proto::DownloadFirmwareRequest>,
    ) -> Result<Response<proto::DownloadFirmwareResponse>, Status> {
        let request = request.into_inner();
        info!("Received DownloadFirmware request for '{}'", request.url);

        let overrides = DownloadOverrides {
            connect_timeout_seconds: (request.connect_timeout_seconds != 0)
                .then_some(request.connect_timeout_seconds as u64),
            total_timeout_seconds: (request.total_timeout_seconds != 0)
                .then_some(request.total_timeout_seconds as u64),
            expected_md5: (!request.expected_md5.is_empty()).then_some(request.expected_md5),
        };

        match self
            .state
            .manager
            .start(&request.url, &request.output_path, overrides)
        {
            Ok(receipt) => Ok(Response::new(proto::DownloadFirmwareResponse {
                session_id: receipt.session_id,
                status: receipt.status.to_string(),
                output_path: receipt.output_path.display().to_string(),
            })),
            Err(StartError::EmptyUrl) => Err(to_status(UpgradeError::new(
                InvalidRequestError::EmptyUrl,
            ))),
            Err(StartError::Conflict) => Err(to_status(UpgradeError::new(
                ServicingError::DownloadInProgress,
            ))),
            Err(StartError::Download(e)) => Err(Status::internal(format!(
                "{}: {}",
                e.category.name(),
                e.message
            ))),
        }
    }

    async fn get_download_status(
        &self,
        request: Request<proto::GetDownloadStatusRequest>,
    ) -> Result<Response<proto::GetDownloadStatusResponse>, Status> {
        let request = request.into_inner();
        let snapshot = self
            .state
            .manager
            .status(&request.session_id)
            .map_err(|e| {
                to_status(match e {
                    StatusError::NoSession => UpgradeError::new(InvalidRequestError::NoSession),
                    StatusError::Mismatch { requested, active } => {
                        UpgradeError::new(InvalidRequestError::SessionMismatch {
                            requested,
                            active,
                        })
                    }
                })
            })?;

        use proto::get_download_status_response::State;
        let session = snapshot.session;
        let state = match session.state {
            DownloadState::Starting => State::Starting(proto::DownloadStarting {
                message: "Download starting".to_string(),
            }),
            DownloadState::Downloading => State::Progress(proto::DownloadProgress {
                downloaded_bytes: session.downloaded_bytes,
                total_bytes: session.total_bytes,
                speed_bytes_per_sec: session.speed_bytes_per_sec,
                percentage: session.percentage(),
                current_method: session.current_method.to_string(),
                attempt_count: session.attempt_count,
                start_time: session.start_time.to_rfc3339(),
                last_update: session.last_update.to_rfc3339(),
            }),
            DownloadState::Completed => {
                let outcome = session
                    .outcome
                    .ok_or_else(|| Status::internal("Completed session has no result"))?;
                State::Result(proto::DownloadResult {
                    file_path: outcome.file_path.display().to_string(),
                    file_size_bytes: outcome.size_bytes,
                    duration_ms: outcome.duration.as_millis() as u64,
                    attempt_count: outcome.attempt_count,
                    final_method: outcome.final_method.to_string(),
                    url: outcome.url,
                    checksum_validation: outcome.checksum_validation.unwrap_or_default(),
                })
            }
            DownloadState::Failed => {
                let error = session
                    .error
                    .ok_or_else(|| Status::internal("Failed session has no error"))?;
                State::Error(proto::DownloadError {
                    category: error.category.name().to_string(),
                    message: error.message,
                    http_code: error.category.http_code().unwrap_or(0) as u32,
                    url: error.url,
                    attempts: error
                        .attempts
                        .into_iter()
                        .map(|attempt| proto::DownloadAttempt {
                            method: attempt.method.to_string(),
                            binding: attempt.binding,
                            error_message: attempt.error_message,
                            duration_ms: attempt.duration.as_millis() as u64,
                            http_status: attempt.http_status.unwrap_or(0) as u32,
                        })
                        .collect(),
                })
            }
        };

        Ok(Response::new(proto::GetDownloadStatusResponse {
            session_id: session.id,
            state: Some(state),
        }))
    }

    async fn list_firmware_images(
        &self,
        request: Request<proto::ListFirmwareImagesRequest>,
    ) -> Result<Response<proto::ListFirmwareImagesResponse>, Status> {
        let request = request.into_inner();
        let dirs = self.state.search_dirs(&request.search_directories);
        let pattern = request.version_pattern;

        let (records, errors) = tokio::task::spawn_blocking(move || {
            let (records, errors) = ImageRegistry::new(dirs).find_all();
            if pattern.is_empty() {
                Ok((records, errors))
            } else {
                registry::filter_by_pattern(records, &pattern)
                    .structured(InvalidRequestError::InvalidVersionPattern { pattern })
                    .map(|records| (records, errors))
            }
        })
        .await
        .map_err(join_error)?
        .map_err(to_status)?;

        let images = records
            .into_iter()
            .map(|record| proto::FirmwareImage {
                file_path: record.path.display().to_string(),
                version: record.version.raw,
                full_version: record.version.full,
                image_type: record.version.image_type.to_string(),
                file_size_bytes: record.size_bytes,
            })
            .collect();

        Ok(Response::new(proto::ListFirmwareImagesResponse {
            images,
            errors,
        }))
    }

    async fn cleanup_old_firmware(
        &self,
        _request: Request<proto::CleanupOldFirmwareRequest>,
    ) -> Result<Response<proto::CleanupOldFirmwareResponse>, Status> {
        let dirs = self.state.search_dirs(&[]);
        let patterns = self.state.config.firmware.cleanup_patterns.clone();
        info!("Cleaning up old firmware in {} directories", dirs.len());

        let report = tokio::task::spawn_blocking(move || cleanup::cleanup(&dirs, &patterns))
            .await
            .map_err(join_error)?;

        Ok(Response::new(proto::CleanupOldFirmwareResponse {
            files_deleted: report.files_deleted,
            deleted_files: report.deleted_paths,
            errors: report.errors,
            space_freed_bytes: report.bytes_freed,
        }))
    }

    async fn list_images(
        &self,
        _request: Request<proto::ListImagesRequest>,
    ) -> Result<Response<proto::ListImagesResponse>, Status> {
        let installer = self.state.installer.clone();
        let listing = tokio::task::spawn_blocking(move || {
            installer
                .list()
                .structured(ServicingError::ListInstalledImages)
        })
        .await
        .map_err(join_error)?
        .map_err(to_status)?;

        Ok(Response::new(proto::ListImagesResponse {
            images: listing.names(),
            current_image: listing.current.unwrap_or_default(),
            next_image: listing.next.unwrap_or_default(),
        }))
    }

    async fn consolidate_images(
        &self,
        request: Request<proto::ConsolidateImagesRequest>,
    ) -> Result<Response<proto::ConsolidateImagesResponse>, Status> {
        let dry_run = request.into_inner().dry_run;
        let installer = self.state.installer.clone();
        let host_root = self.state.host_paths.host_root.clone();

        let plan = tokio::task::spawn_blocking(move || {
            consolidate::consolidate(&installer, &host_root, dry_run)
        })
        .await
        .map_err(join_error)?
        .map_err(to_status)?;

        Ok(Response::new(proto::ConsolidateImagesResponse {
            current_image: plan.keeper,
            removed_images: plan.would_remove,
            space_freed_bytes: plan.bytes_estimated,
            warnings: plan.warnings,
            executed: plan.executed,
        }))
    }

    async fn set(
        &self,
        _request: Request<proto::SetRequest>,
    ) -> Result<Response<proto::SetResponse>, Status> {
        Err(Status::unimplemented("Set is not implemented"))
    }

    type SubscribeStream = UnboundedReceiverStream<Result<proto::SubscribeResponse, Status>>;

    async fn subscribe(
        &self,
        _request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        Err(Status::unimplemented("Subscribe is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use upgrade_api::config::{DownloadConfig, FirmwareConfig, ServiceConfig};

    use super::*;

    fn test_state(dir: &std::path::Path) -> Arc<ServiceState> {
        Arc::new(ServiceState::new(ConfigFile {
            service: ServiceConfig {
                path_prefix: PathBuf::new(),
                ..Default::default()
            },
            firmware: FirmwareConfig {
                search_dirs: vec![dir.to_path_buf()],
                download_dir: dir.join("downloads"),
                cleanup_patterns: vec!["*.bin".to_string(), "*.swi".to_string()],
            },
            download: DownloadConfig {
                preferred_interface: "testnull0".to_string(),
                connect_timeout_seconds: 5,
                total_timeout_seconds: 30,
                max_fallback_attempts: 10,
                user_agent: "sonic-upgraded-test".to_string(),
            },
        }))
    }

    fn service(dir: &std::path::Path) -> UpgradeService {
        UpgradeService::new(test_state(dir))
    }

    async fn wait_for_terminal_state(
        service: &UpgradeService,
        session_id: &str,
    ) -> proto::get_download_status_response::State {
        use proto::get_download_status_response::State;
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let response = service
                .get_download_status(Request::new(proto::GetDownloadStatusRequest {
                    session_id: session_id.to_string(),
                }))
                .await
                .unwrap()
                .into_inner();
            match response.state.unwrap() {
                state @ (State::Result(_) | State::Error(_)) => return state,
                _ => {
                    assert!(Instant::now() < deadline, "download did not settle in time");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_download_firmware_happy_path() {
        use proto::get_download_status_response::State;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/firmware.bin")
            .with_body("test firmware")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let response = service
            .download_firmware(Request::new(proto::DownloadFirmwareRequest {
                url: format!("{}/firmware.bin", server.url()),
                output_path: String::new(),
                connect_timeout_seconds: 0,
                total_timeout_seconds: 0,
                expected_md5: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.session_id.is_empty());
        assert_eq!(response.status, "starting");
        assert!(response.output_path.ends_with("downloads/firmware.bin"));

        match wait_for_terminal_state(&service, &response.session_id).await {
            State::Result(result) => {
                assert_eq!(result.file_size_bytes, 13);
                assert!(result.attempt_count >= 1);
                assert!(["direct", "ip", "interface"].contains(&result.final_method.as_str()));
                assert_eq!(std::fs::read(&result.file_path).unwrap(), b"test firmware");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_firmware_http_404() {
        use proto::get_download_status_response::State;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let response = service
            .download_firmware(Request::new(proto::DownloadFirmwareRequest {
                url: format!("{}/missing.bin", server.url()),
                output_path: String::new(),
                connect_timeout_seconds: 0,
                total_timeout_seconds: 0,
                expected_md5: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        match wait_for_terminal_state(&service, &response.session_id).await {
            State::Error(error) => {
                assert_eq!(error.category, "http");
                assert_eq!(error.http_code, 404);
                assert_eq!(error.attempts.len(), 1);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_firmware_empty_url() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let status = service
            .download_firmware(Request::new(proto::DownloadFirmwareRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_status_for_unknown_and_mismatched_session() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let status = service
            .get_download_status(Request::new(proto::GetDownloadStatusRequest {
                session_id: "123".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fw.bin")
            .with_body("x")
            .create_async()
            .await;
        let response = service
            .download_firmware(Request::new(proto::DownloadFirmwareRequest {
                url: format!("{}/fw.bin", server.url()),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        let status = service
            .get_download_status(Request::new(proto::GetDownloadStatusRequest {
                session_id: "not-the-id".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        wait_for_terminal_state(&service, &response.session_id).await;
    }

    #[tokio::test]
    async fn test_list_firmware_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), "image_version=\"202311.1\"\n").unwrap();
        std::fs::write(dir.path().join("b.bin"), "image_version=\"202405.2\"\n").unwrap();
        let service = service(dir.path());

        let response = service
            .list_firmware_images(Request::new(proto::ListFirmwareImagesRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.images.len(), 2);
        assert_eq!(response.images[0].version, "202311.1");
        assert_eq!(response.images[0].full_version, "SONiC-OS-202311.1");
        assert_eq!(response.images[0].image_type, "onie");

        let response = service
            .list_firmware_images(Request::new(proto::ListFirmwareImagesRequest {
                search_directories: vec![],
                version_pattern: "^2024".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.images.len(), 1);
        assert_eq!(response.images[0].version, "202405.2");

        let status = service
            .list_firmware_images(Request::new(proto::ListFirmwareImagesRequest {
                search_directories: vec![],
                version_pattern: "[invalid".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_cleanup_old_firmware() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stale.bin"), b"junk").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();
        let service = service(dir.path());

        let response = service
            .cleanup_old_firmware(Request::new(proto::CleanupOldFirmwareRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.files_deleted, 1);
        assert_eq!(response.space_freed_bytes, 4);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_set_and_subscribe_unimplemented() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let status = service
            .set(Request::new(proto::SetRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status = service
            .subscribe(Request::new(proto::SubscribeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }
}
