use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::HubError;

/// The reserved profile that always exists and cannot be removed.
pub const DEFAULT_PROFILE_ID: &str = "default";

/// Identity of one app-server child: a name and a private `CODEX_HOME`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub codex_home: PathBuf,
    pub created_at: i64,
}

/// JSON-file registry of profiles.
///
/// The file is rewritten whole on every mutation (temp file + rename). A
/// `default` entry is guaranteed after load.
pub struct ProfileStore {
    path: PathBuf,
    profiles_dir: PathBuf,
    inner: Mutex<Vec<Profile>>,
}

impl ProfileStore {
    /// Loads (or seeds) the registry at `path`. New profiles without an
    /// explicit home get one under `profiles_dir`; the default profile uses
    /// `default_codex_home`.
    pub fn load(
        path: PathBuf,
        profiles_dir: PathBuf,
        default_codex_home: PathBuf,
    ) -> Result<Self, HubError> {
        let mut profiles: Vec<Profile> = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(HubError::io(
                    format!("failed to read {}", path.display()),
                    err,
                ))
            }
        };

        if !profiles.iter().any(|p| p.id == DEFAULT_PROFILE_ID) {
            profiles.insert(
                0,
                Profile {
                    id: DEFAULT_PROFILE_ID.to_string(),
                    name: "Default".to_string(),
                    codex_home: default_codex_home,
                    created_at: crate::stores::now_ms(),
                },
            );
            write_profiles(&path, &profiles)?;
            info!(path = %path.display(), "seeded default profile");
        }

        Ok(Self {
            path,
            profiles_dir,
            inner: Mutex::new(profiles),
        })
    }

    pub fn list(&self) -> Vec<Profile> {
        self.inner.lock().expect("profile registry poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<Profile> {
        self.inner
            .lock()
            .expect("profile registry poisoned")
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Creates a profile with a fresh id and persists the registry.
    pub fn create(&self, name: &str, codex_home: Option<PathBuf>) -> Result<Profile, HubError> {
        let id = Uuid::new_v4().to_string();
        let profile = Profile {
            codex_home: codex_home.unwrap_or_else(|| self.profiles_dir.join(&id)),
            id,
            name: name.to_string(),
            created_at: crate::stores::now_ms(),
        };

        let mut guard = self.inner.lock().expect("profile registry poisoned");
        guard.push(profile.clone());
        write_profiles(&self.path, &guard)?;
        Ok(profile)
    }

    /// Removes a profile. The default profile is refused.
    pub fn remove(&self, id: &str) -> Result<(), HubError> {
        if id == DEFAULT_PROFILE_ID {
            return Err(HubError::DefaultProfileProtected);
        }

        let mut guard = self.inner.lock().expect("profile registry poisoned");
        let before = guard.len();
        guard.retain(|p| p.id != id);
        if guard.len() == before {
            return Err(HubError::UnknownProfile(id.to_string()));
        }
        write_profiles(&self.path, &guard)?;
        Ok(())
    }
}

fn write_profiles(path: &Path, profiles: &[Profile]) -> Result<(), HubError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| HubError::io(format!("failed to create {}", parent.display()), err))?;
    }

    let serialized = serde_json::to_vec_pretty(profiles)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serialized)
        .map_err(|err| HubError::io(format!("failed to write {}", tmp.display()), err))?;
    fs::rename(&tmp, path)
        .map_err(|err| HubError::io(format!("failed to replace {}", path.display()), err))?;
    Ok(())
}
