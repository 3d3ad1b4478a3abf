//! Error taxonomy shared by the offload, verify and history paths.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A source, target or manifest that must exist does not.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// Read, write, permission or disk-space failure.
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The source media went away mid-run. Fatal for the whole batch.
    #[error("device appears to have been removed while reading {}: {source}", path.display())]
    DeviceRemoved {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed manifest document.
    #[error("invalid manifest: {0}")]
    Format(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn io(context: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            context,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Build an error for a failure on the *source* side of a copy or scan,
    /// escalating to `DeviceRemoved` when the errno says the media is gone.
    pub fn source_io(context: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        if is_device_removed_error(&source) {
            Error::DeviceRemoved {
                path: path.as_ref().to_path_buf(),
                source,
            }
        } else {
            Error::io(context, path, source)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_device_removed(&self) -> bool {
        matches!(self, Error::DeviceRemoved { .. })
    }

    /// Demote a device-removed error to a plain I/O error on that one file,
    /// for when the source is known to still be mounted.
    pub fn into_file_error(self) -> Self {
        match self {
            Error::DeviceRemoved { path, source } => Error::io("Failed to read source", path, source),
            other => other,
        }
    }
}

/// Check if an I/O error indicates the device has been removed
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe => true,
        ErrorKind::ConnectionReset => true,
        ErrorKind::ConnectionAborted => true,
        ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                        | libc::ENODEV
                        | libc::ENXIO
                        | libc::ENOMEDIUM
                        | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}
