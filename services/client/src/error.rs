//! Client error taxonomy and errno translation.
//!
//! Local recovery happens wherever a retry or alternate path exists; errors
//! reach this level only when no forward progress is possible for the
//! current operation.

use remora_proto::StatusCode;

/// Top-level client error, used by the binary to pick an exit code.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("auth: {0}")]
    Auth(#[from] crate::auth::AuthError),
    #[error("transport: {0}")]
    Comm(#[from] crate::comm::CommError),
    #[error("remote operation failed: {0:?}")]
    Remote(StatusCode),
    #[error("unexpected reply from provider")]
    UnexpectedReply,
}

impl ClientError {
    /// Process exit code: 1 for handshake/authentication failures,
    /// 2 for any other fatal error (including a protocol version mismatch).
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Auth(crate::auth::AuthError::Handshake(e)) => {
                if e.is_handshake_failure() { 1 } else { 2 }
            }
            ClientError::Auth(_) => 1,
            ClientError::Comm(e) if e.is_handshake_failure() => 1,
            _ => 2,
        }
    }

    /// POSIX errno for errors surfaced to the FUSE layer.
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::Remote(code) => status_errno(*code),
            _ => libc_consts::EIO,
        }
    }
}

/// Map a remote status code to errno.
pub fn status_errno(code: StatusCode) -> i32 {
    match code {
        StatusCode::Ok => 0,
        StatusCode::NotFound => libc_consts::ENOENT,
        StatusCode::Permission => libc_consts::EACCES,
        StatusCode::QuotaExceeded => libc_consts::EDQUOT,
        StatusCode::InvalidArgument => libc_consts::EINVAL,
        StatusCode::Internal => libc_consts::EIO,
    }
}

/// The handful of errno values the core maps to, kept here so the crate does
/// not need a libc dependency for five constants.
pub mod libc_consts {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EINVAL: i32 = 22;
    pub const EDQUOT: i32 = 122;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_maps_to_posix_errno() {
        assert_eq!(status_errno(StatusCode::NotFound), 2);
        assert_eq!(status_errno(StatusCode::Permission), 13);
        assert_eq!(status_errno(StatusCode::QuotaExceeded), 122);
        assert_eq!(status_errno(StatusCode::Ok), 0);
    }
}
