//! Direct POSIX storage helper: file ids resolve against a root directory
//! on a locally reachable mount of the storage.

use super::{HelperError, StorageHelper};
use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub struct PosixHelper {
    root: PathBuf,
}

impl PosixHelper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PosixHelper { root: root.into() }
    }

    /// Build from provider-supplied helper args; requires `root`.
    pub fn from_args(args: &BTreeMap<String, String>) -> Result<Self, HelperError> {
        let root = args
            .get("root")
            .ok_or_else(|| HelperError::BadParams("posix helper needs 'root'".to_owned()))?;
        Ok(PosixHelper::new(root))
    }

    fn resolve(&self, file_id: &str) -> PathBuf {
        self.root.join(Path::new(file_id))
    }
}

impl StorageHelper for PosixHelper {
    fn read(&self, file_id: &str, buf: &mut [u8], offset: u64) -> Result<usize, HelperError> {
        let file = std::fs::File::open(self.resolve(file_id))?;
        Ok(file.read_at(buf, offset)?)
    }

    fn write(&self, file_id: &str, data: &[u8], offset: u64) -> Result<usize, HelperError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.resolve(file_id))?;
        Ok(file.write_at(data, offset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_write_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let helper = PosixHelper::new(dir.path());

        assert_eq!(helper.write("f", b"hello world", 0).unwrap(), 11);
        assert_eq!(helper.write("f", b"WORLD", 6).unwrap(), 5);

        let mut buf = [0u8; 11];
        assert_eq!(helper.read("f", &mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello WORLD");

        let mut tail = [0u8; 16];
        let n = helper.read("f", &mut tail, 6).unwrap();
        assert_eq!(&tail[..n], b"WORLD");
    }

    #[test]
    fn missing_file_surfaces_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let helper = PosixHelper::new(dir.path());
        let mut buf = [0u8; 4];
        let err = helper.read("absent", &mut buf, 0).err().unwrap();
        assert_eq!(err.errno(), 2);
    }

    #[test]
    fn from_args_requires_root() {
        assert!(PosixHelper::from_args(&BTreeMap::new()).is_err());
        let mut args = BTreeMap::new();
        args.insert("root".to_owned(), "/tmp".to_owned());
        assert!(PosixHelper::from_args(&args).is_ok());
    }
}
