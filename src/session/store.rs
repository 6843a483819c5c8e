use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::validate_session_id;

/// Credential files of one session, keyed by file name.
pub type CredentialFiles = BTreeMap<String, Value>;

/// Partial credential update pushed by the protocol; `None` deletes the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialUpdate {
    pub files: BTreeMap<String, Option<Value>>,
}

/// Per-session credential directories under a common root:
/// `{root}/{session_id}/{file}.json`.
///
/// A session "has credentials" exactly when its directory exists.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        match self.session_dir(session_id) {
            Ok(dir) => tokio::fs::metadata(&dir)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read every credential file of a session. A missing directory yields an
    /// empty set (fresh pairing).
    pub async fn load(&self, session_id: &str) -> Result<CredentialFiles> {
        let dir = self.session_dir(session_id)?;
        let mut files = CredentialFiles::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let value: Value = serde_json::from_slice(&raw)
                .with_context(|| format!("corrupt credential file {}", path.display()))?;
            files.insert(name, value);
        }
        Ok(files)
    }

    /// Persist an update. Each write goes through a temp file and a rename so a
    /// crash never leaves a half-written credential behind.
    pub async fn apply(&self, session_id: &str, update: &CredentialUpdate) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create dir: {}", dir.display()))?;

        for (name, value) in &update.files {
            validate_file_name(name)?;
            let path = dir.join(name);
            match value {
                Some(value) => {
                    let tmp = dir.join(format!(".{name}.tmp"));
                    let bytes = serde_json::to_vec(value)?;
                    tokio::fs::write(&tmp, bytes)
                        .await
                        .with_context(|| format!("failed to write {}", tmp.display()))?;
                    tokio::fs::rename(&tmp, &path)
                        .await
                        .with_context(|| format!("failed to replace {}", path.display()))?;
                }
                None => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to remove {}", path.display()));
                    }
                },
            }
        }
        Ok(())
    }

    /// Remove a session's credentials. Erasing an absent session is a no-op.
    pub async fn erase(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to erase {}", dir.display())),
        }
    }

    /// Session ids that currently have credentials on disk, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.root.display()));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_session_id(&name).is_ok() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
    {
        bail!("invalid credential file name `{name}`");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn update(files: &[(&str, Option<Value>)]) -> CredentialUpdate {
        CredentialUpdate {
            files: files
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn missing_session_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        assert!(!store.exists("abc").await);
        assert!(store.load("abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        store
            .apply(
                "abc",
                &update(&[
                    ("creds.json", Some(json!({"me": {"id": "1555:1@s.whatsapp.net"}}))),
                    ("pre-key-1.json", Some(json!({"k": 1}))),
                ]),
            )
            .await
            .unwrap();

        assert!(store.exists("abc").await);
        let files = store.load("abc").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["pre-key-1.json"], json!({"k": 1}));
    }

    #[tokio::test]
    async fn none_deletes_a_file() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        store
            .apply("abc", &update(&[("a.json", Some(json!(1))), ("b.json", Some(json!(2)))]))
            .await
            .unwrap();
        store
            .apply("abc", &update(&[("a.json", None), ("never.json", None)]))
            .await
            .unwrap();

        let files = store.load("abc").await.unwrap();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["b.json"]);
    }

    #[tokio::test]
    async fn erase_removes_directory_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        store
            .apply("abc", &update(&[("creds.json", Some(json!({})))]))
            .await
            .unwrap();

        store.erase("abc").await.unwrap();
        assert!(!store.exists("abc").await);
        store.erase("abc").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_sorted_session_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path().join("sessions"));
        assert!(store.list().await.unwrap().is_empty());

        for id in ["zeta", "alpha"] {
            store
                .apply(id, &update(&[("creds.json", Some(json!({})))]))
                .await
                .unwrap();
        }
        std::fs::write(tmp.path().join("sessions").join("stray.txt"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path());
        assert!(store.load("../etc").await.is_err());
        assert!(
            store
                .apply("abc", &update(&[("../escape.json", Some(json!(1)))]))
                .await
                .is_err()
        );
    }
}
