//! Storage helper contract and factory.
//!
//! A helper moves bytes between the client and one storage backend. Calls
//! block the caller; they are invoked from filesystem-adapter threads,
//! never from runtime workers. Failures carry an errno surfaced negative to
//! the adapter.

pub mod posix;
pub mod proxy;

use crate::comm::CommError;
use crate::error::{libc_consts, status_errno};
use remora_proto::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use posix::PosixHelper;
pub use proxy::ProxyHelper;

/// Byte transfer against one storage backend.
pub trait StorageHelper: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read (0 at
    /// or past end of file).
    fn read(&self, file_id: &str, buf: &mut [u8], offset: u64) -> Result<usize, HelperError>;

    /// Write `data` at `offset`; returns bytes written.
    fn write(&self, file_id: &str, data: &[u8], offset: u64) -> Result<usize, HelperError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote operation failed: {0:?}")]
    Remote(StatusCode),
    #[error("transport: {0}")]
    Comm(#[from] CommError),
    #[error("unusable helper parameters: {0}")]
    BadParams(String),
    #[error("unexpected reply from provider")]
    BadReply,
}

impl HelperError {
    /// POSIX errno for the filesystem adapter.
    pub fn errno(&self) -> i32 {
        match self {
            HelperError::Io(e) => e.raw_os_error().unwrap_or(libc_consts::EIO),
            HelperError::Remote(code) => status_errno(*code),
            HelperError::BadParams(_) => libc_consts::EINVAL,
            HelperError::Comm(_) | HelperError::BadReply => libc_consts::EIO,
        }
    }
}

/// Construct a direct helper from a provider-supplied description.
pub fn build_direct_helper(
    helper_name: &str,
    helper_args: &BTreeMap<String, String>,
) -> Result<Arc<dyn StorageHelper>, HelperError> {
    match helper_name {
        "posix" => Ok(Arc::new(PosixHelper::from_args(helper_args)?)),
        other => Err(HelperError::BadParams(format!(
            "unknown helper '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_helper_name_is_rejected() {
        let err = build_direct_helper("tape", &BTreeMap::new()).err().unwrap();
        assert_eq!(err.errno(), libc_consts::EINVAL);
    }

    #[test]
    fn helper_errors_map_to_errno() {
        let not_found = HelperError::Io(std::io::Error::from_raw_os_error(2));
        assert_eq!(not_found.errno(), 2);
        assert_eq!(HelperError::Remote(StatusCode::Permission).errno(), 13);
        assert_eq!(HelperError::BadReply.errno(), libc_consts::EIO);
    }
}
