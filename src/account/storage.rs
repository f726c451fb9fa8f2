//! Account storage backends.
//!
//! A backend advertises which operations it supports; the registry adapts —
//! capability bits the backend cannot honor are cleared from the root's
//! effective ACL. The bundled [`FileAccountStorage`] keeps every record in
//! one JSON file, rewritten atomically.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Which operations the backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageFeatures {
    pub list: bool,
    pub add: bool,
    pub remove: bool,
    pub certificate_login: bool,
    pub notification: bool,
}

impl StorageFeatures {
    pub const NONE: StorageFeatures = StorageFeatures {
        list: false,
        add: false,
        remove: false,
        certificate_login: false,
        notification: false,
    };

    pub const ALL: StorageFeatures = StorageFeatures {
        list: true,
        add: true,
        remove: true,
        certificate_login: true,
        notification: true,
    };
}

/// One persistent account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Certificate fingerprints this account logs in with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountStorage: Send + Sync {
    fn features(&self) -> StorageFeatures;
    async fn list(&self) -> Result<Vec<AccountRecord>, StorageError>;
    async fn lookup(&self, id: &str) -> Result<Option<AccountRecord>, StorageError>;
    async fn lookup_by_name(&self, name: &str) -> Result<Vec<AccountRecord>, StorageError>;
    /// Map a certificate fingerprint to an account id.
    async fn login_by_fingerprint(&self, fingerprint: &str)
        -> Result<Option<String>, StorageError>;
    async fn add(&self, record: &AccountRecord) -> Result<(), StorageError>;
    async fn remove(&self, id: &str) -> Result<(), StorageError>;
}

// ─── File backend ────────────────────────────────────────────────────────────

#[derive(Default, Serialize, Deserialize)]
struct AccountFile {
    accounts: Vec<AccountRecord>,
}

/// All accounts in one JSON file.
pub struct FileAccountStorage {
    path: PathBuf,
}

impl FileAccountStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAccountStorage { path: path.into() }
    }

    async fn load(&self) -> Result<AccountFile, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Format(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AccountFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, file: &AccountFile) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(file).expect("accounts serialize");
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl AccountStorage for FileAccountStorage {
    fn features(&self) -> StorageFeatures {
        StorageFeatures::ALL
    }

    async fn list(&self) -> Result<Vec<AccountRecord>, StorageError> {
        Ok(self.load().await?.accounts)
    }

    async fn lookup(&self, id: &str) -> Result<Option<AccountRecord>, StorageError> {
        Ok(self.load().await?.accounts.into_iter().find(|a| a.id == id))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<AccountRecord>, StorageError> {
        Ok(self
            .load()
            .await?
            .accounts
            .into_iter()
            .filter(|a| a.name.as_deref() == Some(name))
            .collect())
    }

    async fn login_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .load()
            .await?
            .accounts
            .into_iter()
            .find(|a| a.fingerprints.iter().any(|f| f == fingerprint))
            .map(|a| a.id))
    }

    async fn add(&self, record: &AccountRecord) -> Result<(), StorageError> {
        let mut file = self.load().await?;
        if file.accounts.iter().any(|a| a.id == record.id) {
            return Err(StorageError::Collision(record.id.clone()));
        }
        file.accounts.push(record.clone());
        self.save(&file).await
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let mut file = self.load().await?;
        let before = file.accounts.len();
        file.accounts.retain(|a| a.id != id);
        if file.accounts.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }
        self.save(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, fp: &str) -> AccountRecord {
        AccountRecord {
            id: id.into(),
            name: Some(name.into()),
            fingerprints: vec![fp.into()],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAccountStorage::new(dir.path().join("accounts.json"));

        storage.add(&record("a1", "alice", "fp-a")).await.unwrap();
        storage.add(&record("b1", "bob", "fp-b")).await.unwrap();

        assert_eq!(storage.list().await.unwrap().len(), 2);
        assert_eq!(
            storage.login_by_fingerprint("fp-b").await.unwrap(),
            Some("b1".to_string())
        );
        assert_eq!(
            storage.lookup_by_name("alice").await.unwrap()[0].id,
            "a1"
        );

        storage.remove("a1").await.unwrap();
        assert!(storage.lookup("a1").await.unwrap().is_none());
        assert!(matches!(
            storage.remove("a1").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAccountStorage::new(dir.path().join("accounts.json"));
        storage.add(&record("a1", "alice", "fp")).await.unwrap();
        assert!(matches!(
            storage.add(&record("a1", "alice2", "fp2")).await.unwrap_err(),
            StorageError::Collision(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_file_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAccountStorage::new(dir.path().join("accounts.json"));
        assert!(storage.list().await.unwrap().is_empty());
    }
}
