use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;

use crate::errors::DispatcherError;

/// A login name accepted by the dispatcher: ASCII `[A-Za-z0-9_.-]`, length
/// 1..=64. Doubles as the directory name under the root path, so parsing is
/// also what keeps traversal characters out of filesystem operations.
///
/// Must be instantiated with `UserName::parse`; the field is left private to
/// prevent bypassing of `parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserName(String);

impl UserName {
    pub fn parse(name: &str) -> Result<Self, String> {
        let ok_len = !name.is_empty() && name.len() <= 64;
        let ok_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        match ok_len && ok_chars {
            true => Ok(Self(name.to_string())),
            false => Err(format!("Invalid agent name: {name:?}")),
        }
    }
}

impl AsRef<str> for UserName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserName {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// On-disk coordinates of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub name: String,
    pub path: PathBuf,
}

impl UserConfig {
    /// The agent-private subtree; everything the agent persists lives here.
    pub fn data_path(&self) -> PathBuf {
        self.path.join("data")
    }
}

/// Filesystem-backed registry of users under a single root directory.
///
/// A user exists iff `<root>/<name>/` exists. Destructive preconditions that
/// depend on runtime state (agent must be stopped) are the supervisor's job;
/// the registry only guards layout and name validity. Mutations are
/// serialized by an internal lock.
#[derive(Clone)]
pub struct UserRegistry {
    root: PathBuf,
    mutations: Arc<Mutex<()>>,
}

impl UserRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mutations: Arc::new(Mutex::new(())),
        }
    }

    /// Create `<root>/<name>/data/` with restrictive permissions.
    pub fn add(
        &self,
        name: &UserName,
    ) -> Result<UserConfig, DispatcherError> {
        let _guard = self.mutations.lock().unwrap();
        let path = self.root.join(name.as_ref());
        if path.exists() {
            return Err(DispatcherError::Exists(name.to_string()));
        }
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&path)
            .with_context(|| format!("failed to create user directory {}", path.display()))?;
        builder
            .create(path.join("data"))
            .with_context(|| format!("failed to create data directory under {}", path.display()))?;
        Ok(UserConfig {
            name: name.to_string(),
            path,
        })
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Result<UserConfig, DispatcherError> {
        let name = UserName::parse(name).map_err(DispatcherError::Validation)?;
        let path = self.root.join(name.as_ref());
        if !path.is_dir() {
            return Err(DispatcherError::NotFound(name.to_string()));
        }
        Ok(UserConfig {
            name: name.to_string(),
            path,
        })
    }

    /// All registered names, sorted for stable listings.
    pub fn list(&self) -> Result<Vec<String>, DispatcherError> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read root path {}", self.root.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.context("failed to read root path entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Ok(name) = UserName::parse(&entry.file_name().to_string_lossy()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drop the user and everything below `<root>/<name>/`.
    pub fn remove(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        let user = self.get(name)?;
        let _guard = self.mutations.lock().unwrap();
        fs::remove_dir_all(&user.path)
            .with_context(|| format!("failed to remove {}", user.path.display()))?;
        Ok(())
    }

    /// Empty `data/` while keeping the user registered.
    pub fn reset(
        &self,
        name: &str,
    ) -> Result<(), DispatcherError> {
        let user = self.get(name)?;
        let _guard = self.mutations.lock().unwrap();
        let data = user.data_path();
        if data.is_dir() {
            fs::remove_dir_all(&data)
                .with_context(|| format!("failed to wipe {}", data.display()))?;
        }
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        builder
            .create(&data)
            .with_context(|| format!("failed to recreate {}", data.display()))?;
        Ok(())
    }
}
