//! Persistent account store.
//!
//! JSON under the user's config directory, guarded by an advisory lock file
//! and written atomically (temp file + fsync + rename) so a crash mid-save
//! never corrupts the on-disk state. Modeled after
//! `kiro-gateway-rs`'s [`FileTokenStorage`](crate) JSON-with-permissions
//! pattern, extended with the locking/atomicity layer that file lacks.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::model::Account;
use crate::error::{Error, Result};

const CURRENT_VERSION: u32 = 1;
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
const LOCK_MAX_ATTEMPTS: u32 = 5;

/// On-disk shape of the accounts file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountsFile {
    version: u32,
    accounts: Vec<Account>,
    #[serde(rename = "activeIndex")]
    active_index: i64,
}

/// In-memory result of [`AccountStore::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadedAccounts {
    pub accounts: Vec<Account>,
    pub active_index: i64,
}

/// Persistent account store bound to one file path.
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The default path: `$XDG_CONFIG_HOME/opencode/kiro-accounts.json` on
    /// Unix, the platform config dir's `opencode/kiro-accounts.json` otherwise.
    pub fn default_path() -> PathBuf {
        config_home().join("opencode").join("kiro-accounts.json")
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        let name = path
            .file_name()
            .map(|n| format!("{}.lock", n.to_string_lossy()))
            .unwrap_or_else(|| "kiro-accounts.json.lock".to_string());
        path.set_file_name(name);
        path
    }

    /// Loads the accounts file. A missing file, a corrupt file, or an
    /// unrecognised `version` all load as empty rather than propagating an
    /// error, per the store's tolerant-loading contract.
    pub fn load(&self) -> Result<LoadedAccounts> {
        let _guard = self.acquire_lock()?;
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<LoadedAccounts> {
        if !self.path.exists() {
            return Ok(LoadedAccounts::default());
        }
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read accounts file");
                return Ok(LoadedAccounts::default());
            }
        };
        if content.trim().is_empty() {
            return Ok(LoadedAccounts::default());
        }
        let parsed: AccountsFile = match serde_json::from_str(&content) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt accounts file, treating as empty");
                return Ok(LoadedAccounts::default());
            }
        };
        if parsed.version != CURRENT_VERSION {
            tracing::warn!(
                found = parsed.version,
                expected = CURRENT_VERSION,
                "unknown accounts file version, resetting to empty"
            );
            return Ok(LoadedAccounts::default());
        }
        Ok(LoadedAccounts {
            accounts: parsed.accounts,
            active_index: parsed.active_index,
        })
    }

    /// Atomically persists `storage` under the file lock.
    pub fn save(&self, storage: &LoadedAccounts) -> Result<()> {
        let _guard = self.acquire_lock()?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage_io(parent, e.to_string()))?;
        }

        let on_disk = AccountsFile {
            version: CURRENT_VERSION,
            accounts: storage.accounts.clone(),
            active_index: storage.active_index,
        };
        let content = serde_json::to_string_pretty(&on_disk)?;

        let suffix: u32 = rand::rng().random();
        let tmp_path = {
            let mut p = self.path.clone();
            let name = p
                .file_name()
                .map(|n| format!("{}.tmp.{suffix:08x}", n.to_string_lossy()))
                .unwrap_or_else(|| format!("kiro-accounts.json.tmp.{suffix:08x}"));
            p.set_file_name(name);
            p
        };

        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;
            file.write_all(content.as_bytes())
                .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;
            file.sync_all()
                .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                let _ = std::fs::set_permissions(&tmp_path, perms);
            }
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            Error::storage_io(&self.path, e.to_string())
        })?;

        Ok(())
    }

    /// Acquires the advisory lock, treating a lock file older than
    /// [`LOCK_STALE_AFTER`] as abandoned and removing it. Retries up to
    /// [`LOCK_MAX_ATTEMPTS`] times with exponential backoff.
    fn acquire_lock(&self) -> Result<LockGuard> {
        let lock_path = self.lock_path();
        let mut delay = Duration::from_millis(50);

        for attempt in 0..LOCK_MAX_ATTEMPTS {
            if let Some(parent) = lock_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(LockGuard { path: lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = std::fs::metadata(&lock_path) {
                        if let Ok(modified) = meta.modified() {
                            if modified.elapsed().unwrap_or(Duration::ZERO) > LOCK_STALE_AFTER {
                                let _ = std::fs::remove_file(&lock_path);
                                continue;
                            }
                        }
                    }
                    if attempt + 1 == LOCK_MAX_ATTEMPTS {
                        break;
                    }
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(Error::storage_io(&lock_path, e.to_string())),
            }
        }

        Err(Error::LockUnavailable { path: lock_path })
    }
}

/// RAII lock-file guard; removes the lock file on drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn config_home() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AuthMethod;

    fn sample_account() -> Account {
        Account::new(
            "a@b.com".into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "cid".into(),
            "sec".into(),
            None,
            None,
            "rt".into(),
        )
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        let loaded = store.load().unwrap();
        assert!(loaded.accounts.is_empty());
        assert_eq!(loaded.active_index, 0);
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, "{ not json at all").unwrap();
        let store = AccountStore::new(path);
        let loaded = store.load().unwrap();
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn unknown_version_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, r#"{"version":99,"accounts":[],"activeIndex":0}"#).unwrap();
        let store = AccountStore::new(path);
        let loaded = store.load().unwrap();
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn save_then_load_round_trips_identifying_and_credential_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        let account = sample_account();
        let saved = LoadedAccounts {
            accounts: vec![account.clone()],
            active_index: 0,
        };
        store.save(&saved).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        let reloaded = &loaded.accounts[0];
        assert_eq!(reloaded.id, account.id);
        assert_eq!(reloaded.email, account.email);
        assert_eq!(reloaded.client_id, account.client_id);
        assert_eq!(reloaded.client_secret, account.client_secret);
        assert_eq!(reloaded.refresh_token, account.refresh_token);
    }

    #[test]
    fn save_does_not_leave_a_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        store
            .save(&LoadedAccounts {
                accounts: vec![sample_account()],
                active_index: 0,
            })
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn stale_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        let lock_path = store.lock_path();
        std::fs::write(&lock_path, b"").unwrap();

        let stale_time = std::time::SystemTime::now() - Duration::from_secs(20);
        let file = std::fs::File::open(&lock_path).unwrap();
        file.set_modified(stale_time).ok();

        // Should succeed despite the pre-existing lock file, since it's stale.
        let loaded = store.load().unwrap();
        assert!(loaded.accounts.is_empty());
    }
}
