use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::payload::CatalogPayload;
use crate::store::Store;

/// A store that serializes the whole catalog to one BSON file.
///
/// Writes go to a sibling temp file which is fsynced and renamed over
/// the target, so the file on disk is always a complete catalog. A
/// missing file loads as an empty catalog; a malformed one is fatal.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> FileStore {
        FileStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Catalog, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no catalog file, starting empty");
                return Ok(Catalog::new());
            }
            Err(e) => return Err(e.into()),
        };
        let payload: CatalogPayload = bson::from_slice(&bytes)?;
        payload.into_catalog()
    }

    fn store(&self, catalog: &Catalog) -> Result<(), StoreError> {
        let bytes = bson::to_vec(&CatalogPayload::from_catalog(catalog))?;

        let temp = self.temp_path();
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, &self.path)?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "persisted catalog");
        Ok(())
    }
}
