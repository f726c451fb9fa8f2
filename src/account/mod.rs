//! The account registry.
//!
//! Accounts are the principals permissions are evaluated against. The
//! registry holds the union of transient accounts (process lifetime only,
//! always including `default`) and accounts mirrored in the account storage
//! backend. Certificate logins try transient accounts first, then storage,
//! and fall back to `default` on a miss.

pub mod cert;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::acl::DEFAULT_ACCOUNT;
use crate::proto::{DirectoryError, WireAccount};
use storage::{AccountRecord, AccountStorage, StorageFeatures};

pub type AccountId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: Option<String>,
}

impl Account {
    pub fn wire(&self) -> WireAccount {
        WireAccount {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

struct TransientEntry {
    account: Account,
    fingerprints: Vec<String>,
}

/// Result of swapping the account storage backend at runtime.
#[derive(Debug, Default)]
pub struct SwapDiff {
    pub added: Vec<Account>,
    pub removed: Vec<AccountId>,
}

pub struct AccountRegistry {
    transient: HashMap<AccountId, TransientEntry>,
    backend: Option<Arc<dyn AccountStorage>>,
}

impl AccountRegistry {
    pub fn new(backend: Option<Arc<dyn AccountStorage>>) -> Self {
        let mut transient = HashMap::new();
        transient.insert(
            DEFAULT_ACCOUNT.to_string(),
            TransientEntry {
                account: Account {
                    id: DEFAULT_ACCOUNT.to_string(),
                    name: None,
                },
                fingerprints: Vec::new(),
            },
        );
        AccountRegistry { transient, backend }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Feature flags of the current backend; everything off without one.
    pub fn features(&self) -> StorageFeatures {
        self.backend
            .as_ref()
            .map(|b| b.features())
            .unwrap_or(StorageFeatures::NONE)
    }

    pub fn add_transient(&mut self, account: Account, fingerprints: Vec<String>) {
        self.transient.insert(
            account.id.clone(),
            TransientEntry {
                account,
                fingerprints,
            },
        );
    }

    pub async fn lookup(&self, id: &str) -> Option<Account> {
        if let Some(entry) = self.transient.get(id) {
            return Some(entry.account.clone());
        }
        let backend = self.backend.as_ref()?;
        match backend.lookup(id).await {
            Ok(record) => record.map(|r| Account {
                id: r.id,
                name: r.name,
            }),
            Err(e) => {
                warn!(id, err = %e, "account lookup failed");
                None
            }
        }
    }

    pub async fn is_known(&self, id: &str) -> bool {
        self.lookup(id).await.is_some()
    }

    pub async fn lookup_by_name(&self, name: &str) -> Vec<Account> {
        let mut out: Vec<Account> = self
            .transient
            .values()
            .filter(|e| e.account.name.as_deref() == Some(name))
            .map(|e| e.account.clone())
            .collect();
        if let Some(backend) = &self.backend {
            match backend.lookup_by_name(name).await {
                Ok(records) => {
                    for r in records {
                        if !out.iter().any(|a| a.id == r.id) {
                            out.push(Account {
                                id: r.id,
                                name: r.name,
                            });
                        }
                    }
                }
                Err(e) => warn!(name, err = %e, "account name lookup failed"),
            }
        }
        out
    }

    /// Map a certificate fingerprint to an account id; transient accounts
    /// first, then storage. A miss lands on `default`.
    pub async fn login_by_fingerprint(&self, fingerprint: Option<&str>) -> AccountId {
        let Some(fingerprint) = fingerprint else {
            return DEFAULT_ACCOUNT.to_string();
        };
        for entry in self.transient.values() {
            if entry.fingerprints.iter().any(|f| f == fingerprint) {
                return entry.account.id.clone();
            }
        }
        if let Some(backend) = &self.backend {
            if backend.features().certificate_login {
                match backend.login_by_fingerprint(fingerprint).await {
                    Ok(Some(id)) => return id,
                    Ok(None) => {}
                    Err(e) => warn!(err = %e, "certificate login failed"),
                }
            }
        }
        DEFAULT_ACCOUNT.to_string()
    }

    /// Every known account: transient plus the backend listing (when the
    /// backend can list).
    pub async fn list_all(&self) -> Vec<Account> {
        let mut out: Vec<Account> = self.transient.values().map(|e| e.account.clone()).collect();
        if let Some(backend) = &self.backend {
            if backend.features().list {
                match backend.list().await {
                    Ok(records) => {
                        for r in records {
                            if !out.iter().any(|a| a.id == r.id) {
                                out.push(Account {
                                    id: r.id,
                                    name: r.name,
                                });
                            }
                        }
                    }
                    Err(e) => warn!(err = %e, "account listing failed"),
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// A fresh, unused account id.
    pub fn fresh_id() -> AccountId {
        format!("user-{}", Uuid::new_v4())
    }

    /// Create a persistent account from a prepared record. Authorization
    /// and announcements are the caller's business; this validates and
    /// writes.
    pub async fn add_persistent(
        &mut self,
        record: AccountRecord,
    ) -> Result<Account, DirectoryError> {
        if let Some(name) = record.name.as_deref() {
            if !self.lookup_by_name(name).await.is_empty() {
                return Err(DirectoryError::DuplicateAccount(name.to_string()));
            }
        }
        let backend = self
            .backend
            .as_ref()
            .ok_or(DirectoryError::OperationUnsupported)?;
        if !backend.features().add {
            return Err(DirectoryError::OperationUnsupported);
        }
        backend.add(&record).await.map_err(|e| {
            warn!(id = %record.id, err = %e, "account add failed");
            DirectoryError::NoStorage
        })?;
        Ok(Account {
            id: record.id,
            name: record.name,
        })
    }

    /// Convenience for a new named persistent account.
    pub async fn create_persistent(
        &mut self,
        name: &str,
        fingerprints: Vec<String>,
    ) -> Result<Account, DirectoryError> {
        self.add_persistent(AccountRecord {
            id: Self::fresh_id(),
            name: Some(name.to_string()),
            fingerprints,
            created_at: Utc::now(),
        })
        .await
    }

    /// Remove an account. Removing `default` is refused as a policy choice.
    pub async fn remove(&mut self, id: &str) -> Result<(), DirectoryError> {
        if id == DEFAULT_ACCOUNT {
            return Err(DirectoryError::NoSuchAccount(id.to_string()));
        }
        if self.transient.remove(id).is_some() {
            return Ok(());
        }
        let backend = self
            .backend
            .as_ref()
            .ok_or(DirectoryError::NoSuchAccount(id.to_string()))?;
        if !backend.features().remove {
            return Err(DirectoryError::OperationUnsupported);
        }
        backend.remove(id).await.map_err(|e| match e {
            crate::storage::StorageError::NotFound(_) => {
                DirectoryError::NoSuchAccount(id.to_string())
            }
            other => {
                warn!(id, err = %other, "account remove failed");
                DirectoryError::NoStorage
            }
        })
    }

    /// Swap the backend at runtime, computing the best-effort account diff.
    /// When neither side can be listed the diff is assumed empty, which may
    /// silently preserve stale permissions — hence the warning.
    pub async fn swap_backend(
        &mut self,
        new: Option<Arc<dyn AccountStorage>>,
    ) -> SwapDiff {
        let old = std::mem::replace(&mut self.backend, new);

        let old_list = match &old {
            None => Some(Vec::new()),
            Some(b) if b.features().list => b.list().await.ok(),
            Some(_) => None,
        };
        let new_list = match &self.backend {
            None => Some(Vec::new()),
            Some(b) if b.features().list => b.list().await.ok(),
            Some(_) => None,
        };

        let mut diff = SwapDiff::default();
        match (old_list, new_list) {
            (Some(old_records), Some(new_records)) => {
                for r in &new_records {
                    if !old_records.iter().any(|o| o.id == r.id) {
                        diff.added.push(Account {
                            id: r.id.clone(),
                            name: r.name.clone(),
                        });
                    }
                }
                for r in &old_records {
                    if !new_records.iter().any(|n| n.id == r.id) {
                        diff.removed.push(r.id.clone());
                    }
                }
            }
            (Some(old_records), None) => {
                // New side cannot list: cross-look-up the old accounts;
                // additions on the new side cannot be discovered.
                if let Some(new_backend) = &self.backend {
                    for r in &old_records {
                        if let Ok(None) = new_backend.lookup(&r.id).await {
                            diff.removed.push(r.id.clone());
                        }
                    }
                }
                warn!("new account storage cannot list; added accounts go unannounced");
            }
            (None, Some(new_records)) => {
                if let Some(old_backend) = &old {
                    for r in &new_records {
                        if let Ok(None) = old_backend.lookup(&r.id).await {
                            diff.added.push(Account {
                                id: r.id.clone(),
                                name: r.name.clone(),
                            });
                        }
                    }
                }
                warn!("old account storage cannot list; removed accounts go unannounced");
            }
            (None, None) => {
                warn!("neither account storage can list; assuming no account changes");
            }
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::FileAccountStorage;

    fn file_backend(dir: &tempfile::TempDir) -> Arc<dyn AccountStorage> {
        Arc::new(FileAccountStorage::new(dir.path().join("accounts.json")))
    }

    #[tokio::test]
    async fn test_default_account_always_exists() {
        let registry = AccountRegistry::new(None);
        let account = registry.lookup(DEFAULT_ACCOUNT).await.unwrap();
        assert_eq!(account.id, DEFAULT_ACCOUNT);
        assert_eq!(
            registry.login_by_fingerprint(Some("unknown")).await,
            DEFAULT_ACCOUNT
        );
    }

    #[tokio::test]
    async fn test_remove_default_is_refused() {
        let mut registry = AccountRegistry::new(None);
        assert_eq!(
            registry.remove(DEFAULT_ACCOUNT).await.unwrap_err(),
            DirectoryError::NoSuchAccount(DEFAULT_ACCOUNT.into())
        );
    }

    #[tokio::test]
    async fn test_transient_login_beats_storage() {
        let dir = tempfile::tempdir().unwrap();
        let backend = file_backend(&dir);
        backend
            .add(&AccountRecord {
                id: "stored".into(),
                name: Some("x".into()),
                fingerprints: vec!["fp".into()],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut registry = AccountRegistry::new(Some(backend));
        registry.add_transient(
            Account {
                id: "temp".into(),
                name: Some("x".into()),
            },
            vec!["fp".into()],
        );
        assert_eq!(registry.login_by_fingerprint(Some("fp")).await, "temp");
    }

    #[tokio::test]
    async fn test_add_persistent_rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AccountRegistry::new(Some(file_backend(&dir)));
        registry
            .create_persistent("alice", vec!["fp-1".into()])
            .await
            .unwrap();
        assert_eq!(
            registry
                .create_persistent("alice", vec!["fp-2".into()])
                .await
                .unwrap_err(),
            DirectoryError::DuplicateAccount("alice".into())
        );
    }

    #[tokio::test]
    async fn test_add_without_backend_is_unsupported() {
        let mut registry = AccountRegistry::new(None);
        assert_eq!(
            registry.create_persistent("alice", vec![]).await.unwrap_err(),
            DirectoryError::OperationUnsupported
        );
    }

    #[tokio::test]
    async fn test_swap_backend_diffs_listings() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = file_backend(&dir_a);
        let b = file_backend(&dir_b);
        let now = Utc::now();
        a.add(&AccountRecord {
            id: "only-a".into(),
            name: None,
            fingerprints: vec![],
            created_at: now,
        })
        .await
        .unwrap();
        a.add(&AccountRecord {
            id: "both".into(),
            name: None,
            fingerprints: vec![],
            created_at: now,
        })
        .await
        .unwrap();
        b.add(&AccountRecord {
            id: "both".into(),
            name: None,
            fingerprints: vec![],
            created_at: now,
        })
        .await
        .unwrap();
        b.add(&AccountRecord {
            id: "only-b".into(),
            name: None,
            fingerprints: vec![],
            created_at: now,
        })
        .await
        .unwrap();

        let mut registry = AccountRegistry::new(Some(a));
        let diff = registry.swap_backend(Some(b)).await;
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "only-b");
        assert_eq!(diff.removed, vec!["only-a".to_string()]);
    }
}
