pub mod config;
pub mod consolidate;
pub mod download;
pub mod grpc;
pub mod pathquery;
pub mod session;

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use log::{info, warn};
use tonic::transport::{Identity, Server, ServerTlsConfig};

use upgrade_api::config::ConfigFile;
use upgrade_api::error::{
    InitializationError, ReportError, UpgradeError, UpgradeResultExt,
};

use crate::grpc::{ServiceState, UpgradeServer, UpgradeService};

/// Runs the upgrade service until a shutdown signal arrives.
pub async fn serve(config: ConfigFile) -> Result<(), UpgradeError> {
    let prefix = &config.service.path_prefix;
    if !prefix.as_os_str().is_empty() && prefix != Path::new("/") && !prefix.is_dir() {
        return Err(UpgradeError::new(InitializationError::HostRootMissing {
            path: prefix.display().to_string(),
        }));
    }

    let addr: SocketAddr = format!(
        "{}:{}",
        config.service.listen_address,
        config.service.listen_port()
    )
    .parse()
    .structured(InitializationError::BindListener)?;
    let shutdown_timeout = Duration::from_secs(config.service.shutdown_timeout_seconds);

    let mut builder = Server::builder();
    if let Some(tls) = &config.service.tls {
        let cert = std::fs::read(&tls.cert_file).structured(
            InitializationError::LoadTlsCredentials {
                path: tls.cert_file.display().to_string(),
            },
        )?;
        let key =
            std::fs::read(&tls.key_file).structured(InitializationError::LoadTlsCredentials {
                path: tls.key_file.display().to_string(),
            })?;
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
            .structured(InitializationError::LoadTlsCredentials {
                path: tls.cert_file.display().to_string(),
            })?;
        info!("TLS enabled");
    }

    let state = Arc::new(ServiceState::new(config));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown_state = state.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received; cancelling any active download");
        shutdown_state.manager.shutdown();
        let _ = shutdown_tx.send(());
        tokio::time::sleep(shutdown_timeout).await;
        warn!("Shutdown grace period expired; exiting");
        std::process::exit(0);
    });

    info!("Listening for RPC requests on {addr}");
    builder
        .add_service(UpgradeServer::new(UpgradeService::new(state)))
        .serve_with_shutdown(addr, async {
            let _ = shutdown_rx.await;
        })
        .await
        .structured(InitializationError::Serve)
        .message("RPC server terminated unexpectedly")
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::os::unix::fs::PermissionsExt;
    use std::{
        env, fs,
        path::{Path, PathBuf},
        sync::Mutex,
    };

    /// Serializes tests that mutate the process-global PATH.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Behavior of the fake `sonic-installer` placed on PATH.
    #[derive(Debug, Clone)]
    pub struct FakeInstaller {
        pub list_output: &'static str,
        pub cleanup_output: &'static str,
        pub set_default_fails: bool,
    }

    impl Default for FakeInstaller {
        fn default() -> Self {
            Self {
                list_output: "",
                cleanup_output: "",
                set_default_fails: false,
            }
        }
    }

    impl FakeInstaller {
        pub fn set_default_marker(&self, host_root: &Path) -> PathBuf {
            host_root.join("set-default.called")
        }

        pub fn cleanup_marker(&self, host_root: &Path) -> PathBuf {
            host_root.join("cleanup.called")
        }
    }

    struct PathGuard {
        original: String,
    }

    impl Drop for PathGuard {
        fn drop(&mut self) {
            env::set_var("PATH", &self.original);
        }
    }

    fn write_script(dir: &Path, name: &str, body: String) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Shadows `nsenter` and `sonic-installer` with fakes, then runs `f`
    /// against a scratch host root.
    pub fn with_fake_tools(fake: &FakeInstaller, f: impl FnOnce(&Path)) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let host_root = dir.path().join("host");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&host_root).unwrap();

        write_script(
            &bin,
            "nsenter",
            concat!(
                "#!/bin/sh\n",
                "while [ \"$1\" != \"--\" ]; do shift; done\n",
                "shift\n",
                "exec \"$@\"\n"
            )
            .to_string(),
        );

        let set_default_body = if fake.set_default_fails {
            "echo 'Error: Image does not exist' >&2; exit 1"
        } else {
            "echo \"Default set to $2\""
        };
        write_script(
            &bin,
            "sonic-installer",
            format!(
                concat!(
                    "#!/bin/sh\n",
                    "case \"$1\" in\n",
                    "list)\n",
                    "cat <<'EOF'\n",
                    "{list_output}",
                    "EOF\n",
                    ";;\n",
                    "set-default)\n",
                    "touch {host_root}/set-default.called\n",
                    "{set_default_body}\n",
                    ";;\n",
                    "cleanup)\n",
                    "touch {host_root}/cleanup.called\n",
                    "cat <<'EOF'\n",
                    "{cleanup_output}",
                    "EOF\n",
                    ";;\n",
                    "esac\n"
                ),
                list_output = fake.list_output,
                cleanup_output = fake.cleanup_output,
                host_root = host_root.display(),
                set_default_body = set_default_body,
            ),
        );

        let path_guard = PathGuard {
            original: env::var("PATH").unwrap_or_default(),
        };
        env::set_var(
            "PATH",
            format!("{}:{}", bin.display(), path_guard.original),
        );

        f(&host_root);
    }
}
