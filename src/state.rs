//! Daemon state store
//!
//! A key/value tree of MessagePack-encoded values. The host daemon owns one
//! instance behind a single lock ([`SharedState`]); every quota operation
//! receives `&mut State`, so it runs start to finish with that lock held.
//!
//! Values are read and written whole. A checkpoint writes the full tree to
//! a temporary sibling file and renames it into place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

/// State shared by all daemon tasks
pub type SharedState = Arc<Mutex<State>>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot encode state key {key:?}: {source}")]
    Encode {
        key: String,
        source: rmp_serde::encode::Error,
    },

    #[error("cannot decode state key {key:?}: {source}")]
    Decode {
        key: String,
        source: rmp_serde::decode::Error,
    },

    #[error("cannot decode state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: rmp_serde::decode::Error,
    },

    #[error("state has no backing file")]
    NoBackingFile,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory state tree with optional file backing
#[derive(Debug, Default)]
pub struct State {
    data: BTreeMap<String, Vec<u8>>,
    path: Option<PathBuf>,
    modified: bool,
}

impl State {
    /// Create an empty state with no backing file
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state from a checkpoint file
    ///
    /// A missing file yields an empty state that will be written on the
    /// first checkpoint.
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        let data = match tokio::fs::read(path).await {
            Ok(bytes) => rmp_serde::from_slice(&bytes).map_err(|source| StateError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No state file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            data,
            path: Some(path.to_path_buf()),
            modified: false,
        })
    }

    /// Wrap this state for sharing between tasks
    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Decode the value stored under `key`, `None` if absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.data.get(key) {
            Some(bytes) => rmp_serde::from_slice(bytes)
                .map(Some)
                .map_err(|source| StateError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Replace the value stored under `key`
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let bytes = rmp_serde::to_vec_named(value).map_err(|source| StateError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.data.insert(key.to_string(), bytes);
        self.modified = true;
        Ok(())
    }

    /// Whether any key changed since the last load or checkpoint
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Write the full tree to the backing file
    pub async fn checkpoint(&mut self) -> Result<(), StateError> {
        let path = self.path.clone().ok_or(StateError::NoBackingFile)?;
        let bytes = rmp_serde::to_vec(&self.data).map_err(|source| StateError::Encode {
            key: String::new(),
            source,
        })?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!("Checkpointed state to {} ({} bytes)", path.display(), bytes.len());
        self.modified = false;
        Ok(())
    }
}
