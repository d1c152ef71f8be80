//! Provider-proxied storage helper: bytes flow client → provider → storage.
//!
//! Used when the direct access probe failed or proxying was forced. Each
//! call blocks the calling thread on a provider round-trip; callers are
//! filesystem-adapter threads, never runtime workers.

use super::{HelperError, StorageHelper};
use crate::comm::Communicator;
use base64::Engine;
use remora_proto::{ClientBody, ServerBody};
use std::sync::Arc;

pub struct ProxyHelper {
    storage_id: String,
    communicator: Arc<Communicator>,
}

impl ProxyHelper {
    pub fn new(storage_id: impl Into<String>, communicator: Arc<Communicator>) -> Self {
        ProxyHelper {
            storage_id: storage_id.into(),
            communicator,
        }
    }
}

impl StorageHelper for ProxyHelper {
    fn read(&self, file_id: &str, buf: &mut [u8], offset: u64) -> Result<usize, HelperError> {
        let reply = self.communicator.communicate_blocking(ClientBody::ProxyRead {
            storage_id: self.storage_id.clone(),
            file_id: file_id.to_owned(),
            offset,
            size: buf.len() as u64,
        })?;
        match reply.body {
            ServerBody::ProxyData { data_base64 } => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(data_base64)
                    .map_err(|_| HelperError::BadReply)?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            ServerBody::Status { code } => Err(HelperError::Remote(code)),
            _ => Err(HelperError::BadReply),
        }
    }

    fn write(&self, file_id: &str, data: &[u8], offset: u64) -> Result<usize, HelperError> {
        let reply = self
            .communicator
            .communicate_blocking(ClientBody::ProxyWrite {
                storage_id: self.storage_id.clone(),
                file_id: file_id.to_owned(),
                offset,
                data_base64: base64::engine::general_purpose::STANDARD.encode(data),
            })?;
        match reply.body {
            ServerBody::ProxyWritten { written } => Ok(written as usize),
            ServerBody::Status { code } => Err(HelperError::Remote(code)),
            _ => Err(HelperError::BadReply),
        }
    }
}
