pub mod config;
pub mod error;

/// Prefix shared by every installable switch image name.
pub const IMAGE_NAME_PREFIX: &str = "SONiC-OS-";

/// Directory name prefix used by installed image payloads on the host root.
pub const IMAGE_DIR_PREFIX: &str = "image-";
