use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DrifterError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("no config file found")]
    #[diagnostic(help("create a ./.drifter or ~/.drifter file, or pass --config-file"))]
    ConfigMissing,

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("digest mismatch for {}: expected {expected}, got {actual}", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("invalid boxcar: missing descriptor {}", path.display())]
    InvalidBoxcar { path: PathBuf },

    #[error("cannot overwrite existing instance: {}", path.display())]
    InstanceExists { path: PathBuf },

    #[error("no address assignment found for hardware address {mac_addr} in lease file")]
    AddressUnassigned { mac_addr: String },

    #[error("bootstrap failed on {addr}: {reason}")]
    #[diagnostic(help("the instance directory is left in place for inspection"))]
    BootstrapFailed { addr: String, reason: String },

    #[error("`{command}` exited with status {status}")]
    #[diagnostic(help("{output}"))]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("failed to generate login key: {message}")]
    KeyGen { message: String },

    #[error("instance '{name}' not found")]
    NotFound { name: String },

    #[error("aborted")]
    Declined,
}
