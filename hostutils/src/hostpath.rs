use std::path::{Path, PathBuf};

/// Host root directory as seen on the host itself.
pub const HOST_ROOT: &str = "/host";

/// GRUB configuration directory on the host.
pub const GRUB_DIR: &str = "/host/grub";

/// ONIE machine descriptor on the host.
pub const MACHINE_CONF: &str = "/host/machine.conf";

/// Kernel command line; the container shares the host kernel.
pub const PROC_CMDLINE: &str = "/proc/cmdline";

fn strip_root(path: &Path) -> &Path {
    match path.strip_prefix("/") {
        Ok(relative) => relative,
        Err(_) => path,
    }
}

/// Rewrites a host-absolute path to its guest-visible location under the
/// configured prefix. An empty or "/" prefix leaves the path untouched
/// (bare-metal deployment); relative paths and paths already under the prefix
/// pass through verbatim.
pub fn resolve(prefix: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let prefix = prefix.as_ref();
    let path = path.as_ref();

    if prefix.as_os_str().is_empty() || prefix == Path::new("/") {
        return path.to_path_buf();
    }
    if !path.is_absolute() {
        return path.to_path_buf();
    }
    if path.starts_with(prefix) {
        return path.to_path_buf();
    }
    prefix.join(strip_root(path))
}

/// Resolved locations of every host file the service reads, built once from
/// the configured prefix and passed to the components that need them.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub prefix: PathBuf,
    /// Host root directory, where installed image payloads live.
    pub host_root: PathBuf,
    pub grub_dir: PathBuf,
    pub grub_env: PathBuf,
    pub boot_config: PathBuf,
    pub machine_conf: PathBuf,
    pub proc_cmdline: PathBuf,
}

impl HostPaths {
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref().to_path_buf();
        let grub_dir = resolve(&prefix, GRUB_DIR);
        let host_root = resolve(&prefix, HOST_ROOT);
        Self {
            grub_env: grub_dir.join("grubenv"),
            boot_config: host_root.join("boot-config"),
            machine_conf: resolve(&prefix, MACHINE_CONF),
            proc_cmdline: PathBuf::from(PROC_CMDLINE),
            host_root,
            grub_dir,
            prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("/mnt/host", "/etc"), Path::new("/mnt/host/etc"));
        assert_eq!(
            resolve("/mnt/host", "/host/machine.conf"),
            Path::new("/mnt/host/host/machine.conf")
        );
        assert_eq!(resolve("", "/etc"), Path::new("/etc"));
        assert_eq!(resolve("/", "/etc"), Path::new("/etc"));
        assert_eq!(resolve("/mnt/host", "etc"), Path::new("etc"));
    }

    #[test]
    fn test_resolve_already_prefixed() {
        assert_eq!(
            resolve("/mnt/host", "/mnt/host/etc"),
            Path::new("/mnt/host/etc")
        );
    }

    #[test]
    fn test_resolve_idempotent() {
        let once = resolve("/mnt/host", "/host/grub");
        assert_eq!(resolve("/mnt/host", &once), once);
    }

    #[test]
    fn test_resolve_preserves_relative_components() {
        assert_eq!(
            resolve("/mnt/host", "/a/../b"),
            Path::new("/mnt/host/a/../b")
        );
    }

    #[test]
    fn test_host_paths() {
        let paths = HostPaths::new("/mnt/host");
        assert_eq!(paths.grub_dir, Path::new("/mnt/host/host/grub"));
        assert_eq!(paths.grub_env, Path::new("/mnt/host/host/grub/grubenv"));
        assert_eq!(paths.boot_config, Path::new("/mnt/host/host/boot-config"));
        assert_eq!(paths.proc_cmdline, Path::new("/proc/cmdline"));

        let bare = HostPaths::new("");
        assert_eq!(bare.machine_conf, Path::new("/host/machine.conf"));
    }
}
