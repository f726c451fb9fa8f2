//! Persistent node storage.
//!
//! The directory sees a filesystem-like API and has no opinion about how a
//! backend realizes it. The bundled [`FsStorage`] maps subdirectories to
//! directories, notes to `<name>.note` wrapper files (plugin tag + the
//! plugin's serialized content), and ACLs to JSON sidecars: `<path>.acl`
//! next to a note, `.acl` inside a subdirectory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::acl::SheetSet;
use crate::plugin::{NotePlugin, NoteSession};
use crate::tree::casefold;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed stored data: {0}")]
    Format(String),
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("name collides with an existing entry: {0}")]
    Collision(String),
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
}

/// What kind of thing a directory listing entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Subdirectory,
    /// A note, with the plugin tag recorded in its wrapper file. Whether
    /// that plugin is loaded is the directory's concern, not storage's.
    Note { plugin: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[async_trait]
pub trait NodeStorage: Send + Sync {
    async fn read_subdirectory(&self, path: &str) -> Result<Vec<DirEntry>, StorageError>;
    async fn create_subdirectory(&self, path: &str) -> Result<(), StorageError>;
    /// Remove a node. `plugin` is `Some` for notes, `None` for
    /// subdirectories.
    async fn remove_node(&self, plugin: Option<&str>, path: &str) -> Result<(), StorageError>;
    async fn session_read(
        &self,
        path: &str,
        plugin: &dyn NotePlugin,
    ) -> Result<Box<dyn NoteSession>, StorageError>;
    async fn session_write(
        &self,
        path: &str,
        session: &dyn NoteSession,
        plugin: &dyn NotePlugin,
    ) -> Result<(), StorageError>;
    async fn read_acl(&self, path: &str) -> Result<SheetSet, StorageError>;
    async fn write_acl(&self, path: &str, sheets: &SheetSet) -> Result<(), StorageError>;
}

// ─── Filesystem backend ──────────────────────────────────────────────────────

const NOTE_SUFFIX: &str = ".note";
const ACL_SUFFIX: &str = ".acl";
const SUBDIR_ACL_FILE: &str = ".acl";

/// On-disk wrapper around the plugin's serialized session content.
#[derive(Serialize, Deserialize)]
struct NoteFile {
    plugin: String,
    /// base64 of the plugin's stored form.
    content: String,
}

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStorage { root: root.into() }
    }

    /// Resolve a directory path to a filesystem path under the root.
    /// Components were validated at the directory layer; dot components are
    /// refused again here so a hostile path can never escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut out = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." || part.starts_with('.') {
                return Err(StorageError::InvalidPath(path.to_string()));
            }
            out.push(part);
        }
        Ok(out)
    }

    fn note_file(&self, path: &str) -> Result<PathBuf, StorageError> {
        let resolved = self.resolve(path)?;
        Ok(append_suffix(&resolved, NOTE_SUFFIX))
    }

    fn acl_file(&self, path: &str) -> Result<PathBuf, StorageError> {
        let resolved = self.resolve(path)?;
        // A subdirectory keeps its ACL inside itself; a note keeps a
        // sidecar next to its wrapper file. The root resolves to the
        // storage root, which always exists as a directory.
        if resolved.is_dir() {
            Ok(resolved.join(SUBDIR_ACL_FILE))
        } else {
            Ok(append_suffix(&resolved, ACL_SUFFIX))
        }
    }

    /// Refuse creating an entry whose casefolded name collides with an
    /// existing sibling. Directory-level semantics are case-insensitive;
    /// the backend must not diverge on case-sensitive filesystems.
    async fn check_collision(&self, target: &Path, name: &str) -> Result<(), StorageError> {
        let Some(parent) = target.parent() else {
            return Ok(());
        };
        let folded = casefold(name);
        let mut entries = match tokio::fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let existing = entry.file_name().to_string_lossy().to_string();
            if existing != name && casefold(&existing) == folded {
                return Err(StorageError::Collision(name.to_string()));
            }
        }
        Ok(())
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

/// Write atomically: temp file in the same directory, then rename over.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = append_suffix(path, ".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl NodeStorage for FsStorage {
    async fn read_subdirectory(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let dir = self.resolve(path)?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| StorageError::NotFound(path.to_string()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                out.push(DirEntry {
                    name,
                    kind: EntryKind::Subdirectory,
                });
            } else if let Some(stem) = name.strip_suffix(NOTE_SUFFIX) {
                let bytes = tokio::fs::read(entry.path()).await?;
                let wrapper: NoteFile = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Format(format!("{name}: {e}")))?;
                out.push(DirEntry {
                    name: stem.to_string(),
                    kind: EntryKind::Note {
                        plugin: wrapper.plugin,
                    },
                });
            }
            // ACL sidecars and anything else are not nodes.
        }
        Ok(out)
    }

    async fn create_subdirectory(&self, path: &str) -> Result<(), StorageError> {
        let dir = self.resolve(path)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        self.check_collision(&dir, &name).await?;
        tokio::fs::create_dir(&dir).await?;
        Ok(())
    }

    async fn remove_node(&self, plugin: Option<&str>, path: &str) -> Result<(), StorageError> {
        match plugin {
            None => {
                let dir = self.resolve(path)?;
                tokio::fs::remove_dir_all(&dir).await?;
            }
            Some(_) => {
                let note = self.note_file(path)?;
                tokio::fs::remove_file(&note).await?;
                let acl = append_suffix(&self.resolve(path)?, ACL_SUFFIX);
                if tokio::fs::try_exists(&acl).await.unwrap_or(false) {
                    tokio::fs::remove_file(&acl).await?;
                }
            }
        }
        Ok(())
    }

    async fn session_read(
        &self,
        path: &str,
        plugin: &dyn NotePlugin,
    ) -> Result<Box<dyn NoteSession>, StorageError> {
        let file = self.note_file(path)?;
        let bytes = tokio::fs::read(&file)
            .await
            .map_err(|_| StorageError::NotFound(path.to_string()))?;
        let wrapper: NoteFile = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Format(format!("{path}: {e}")))?;
        if wrapper.plugin != plugin.session_type() {
            return Err(StorageError::Format(format!(
                "{path}: stored as {:?}, read as {:?}",
                wrapper.plugin,
                plugin.session_type()
            )));
        }
        let content = base64::engine::general_purpose::STANDARD
            .decode(&wrapper.content)
            .map_err(|e| StorageError::Format(format!("{path}: {e}")))?;
        plugin
            .read(&content)
            .map_err(|e| StorageError::Format(format!("{path}: {e}")))
    }

    async fn session_write(
        &self,
        path: &str,
        session: &dyn NoteSession,
        plugin: &dyn NotePlugin,
    ) -> Result<(), StorageError> {
        let content = plugin
            .write(session)
            .map_err(|e| StorageError::Format(format!("{path}: {e}")))?;
        let wrapper = NoteFile {
            plugin: plugin.session_type().to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(content),
        };
        let file = self.note_file(path)?;
        debug!(path, file = %file.display(), "writing session");
        atomic_write(&file, &serde_json::to_vec(&wrapper).expect("wrapper serializes")).await
    }

    async fn read_acl(&self, path: &str) -> Result<SheetSet, StorageError> {
        let file = self.acl_file(path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Format(format!("{path}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SheetSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_acl(&self, path: &str, sheets: &SheetSet) -> Result<(), StorageError> {
        let file = self.acl_file(path)?;
        if sheets.is_empty() {
            if tokio::fs::try_exists(&file).await.unwrap_or(false) {
                tokio::fs::remove_file(&file).await?;
            }
            return Ok(());
        }
        atomic_write(&file, &serde_json::to_vec(sheets).expect("sheets serialize")).await
    }
}
