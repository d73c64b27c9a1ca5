//! Self profile persisted as `beagle_profile.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileFields {
    pub name: String,
    pub gender: String,
    pub phone: String,
    pub email: String,
    pub description: String,
    pub region: String,
    pub carrier_user_id: String,
    pub carrier_address: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfProfile {
    #[serde(rename = "welcomeMessage")]
    pub welcome_message: String,
    pub profile: ProfileFields,
}

impl SelfProfile {
    /// Load the profile, or start fresh when the file is missing or
    /// unreadable. A corrupt profile must not keep the sidecar down.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!("corrupt profile {}, starting fresh: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating profile dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }
}

pub fn profile_path(data_dir: &Path) -> PathBuf {
    data_dir.join("beagle_profile.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = profile_path(dir.path());

        let mut profile = SelfProfile::default();
        profile.welcome_message = "welcome aboard".into();
        profile.profile.name = "beagle".into();
        profile.profile.carrier_user_id = "uid-1".into();
        profile.save(&path).unwrap();

        let loaded = SelfProfile::load(&path);
        assert_eq!(loaded.welcome_message, "welcome aboard");
        assert_eq!(loaded.profile.name, "beagle");
        assert_eq!(loaded.profile.carrier_user_id, "uid-1");
    }

    #[test]
    fn test_wire_keys_camel_case() {
        let mut profile = SelfProfile::default();
        profile.profile.carrier_user_id = "u".into();
        profile.profile.started_at = "2026-08-01".into();
        let json = serde_json::to_value(&profile).unwrap();
        assert!(json.get("welcomeMessage").is_some());
        assert_eq!(json["profile"]["carrierUserId"], "u");
        assert_eq!(json["profile"]["startedAt"], "2026-08-01");
    }

    #[test]
    fn test_missing_and_corrupt_files_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = profile_path(dir.path());
        assert_eq!(SelfProfile::load(&path).welcome_message, "");

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(SelfProfile::load(&path).welcome_message, "");
    }
}
