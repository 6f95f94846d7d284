use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for binsync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinsyncConfig {
    /// Repository holding every user's state branch
    #[serde(default = "defaults::default_repo_path")]
    pub repo_path: PathBuf,
    /// The user whose state this process edits
    pub user: String,
    /// Email used in commit author lines
    #[serde(default)]
    pub author_email: Option<String>,
}

impl BinsyncConfig {
    /// Load the config file if present, then apply `BINSYNC_*` overrides.
    ///
    /// Without a config file, `BINSYNC_USER` must be set.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        tracing::debug!("loading binsync config from {:?}", config_path);
        let file = if config_path.exists() {
            Some(Self::load_from_file(&config_path)?)
        } else {
            None
        };
        Self::with_env(file)
    }

    fn with_env(file: Option<Self>) -> Result<Self> {
        let env_user = env::var("BINSYNC_USER").ok();
        let mut config = match (file, env_user) {
            (Some(mut config), user) => {
                if let Some(user) = user {
                    config.user = user;
                }
                config
            }
            (None, Some(user)) => Self {
                repo_path: defaults::default_repo_path(),
                user,
                author_email: None,
            },
            (None, None) => {
                return Err(Error::Precondition(
                    "no config file and BINSYNC_USER is not set".into(),
                ))
            }
        };

        if let Ok(path) = env::var("BINSYNC_REPO") {
            config.repo_path = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(email) = env::var("BINSYNC_EMAIL") {
            config.author_email = Some(email);
        }
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: BinsyncConfig = serde_yaml::from_str(&content)?;
        config.repo_path = expand_tilde(&config.repo_path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/binsync/config.yaml"))
            .ok_or_else(|| Error::Precondition("could not determine home directory".into()))
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(crate) fn default_repo_path() -> PathBuf {
        PathBuf::from(".")
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("binsync/config.yaml");

        let config = BinsyncConfig {
            repo_path: dir.path().join("repo"),
            user: "alice".into(),
            author_email: Some("alice@example.com".into()),
        };
        config.save(&config_path)?;

        let loaded = BinsyncConfig::load_from_file(&config_path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_tilde_expansion() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "repo_path: ~/re/target\nuser: bob\n")?;

        let loaded = BinsyncConfig::load_from_file(&config_path)?;
        if let Some(home) = dirs::home_dir() {
            assert_eq!(loaded.repo_path, home.join("re/target"));
        }
        assert_eq!(loaded.author_email, None);
        Ok(())
    }

    #[test]
    fn test_unknown_fields_rejected() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, "user: bob\ncolour: blue\n")?;
        assert!(matches!(
            BinsyncConfig::load_from_file(&config_path),
            Err(Error::Yaml(_))
        ));
        Ok(())
    }

    // The only test touching BINSYNC_* so parallel tests never race on them.
    #[test]
    fn test_env_overrides() -> Result<()> {
        env::remove_var("BINSYNC_USER");
        env::remove_var("BINSYNC_REPO");
        env::remove_var("BINSYNC_EMAIL");
        assert!(matches!(
            BinsyncConfig::with_env(None),
            Err(Error::Precondition(_))
        ));

        env::set_var("BINSYNC_USER", "carol");
        env::set_var("BINSYNC_REPO", "~/work/repo");
        env::set_var("BINSYNC_EMAIL", "carol@example.com");

        let file = BinsyncConfig {
            repo_path: PathBuf::from("/elsewhere"),
            user: "alice".into(),
            author_email: None,
        };
        let config = BinsyncConfig::with_env(Some(file))?;
        assert_eq!(config.user, "carol");
        assert_eq!(config.author_email.as_deref(), Some("carol@example.com"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.repo_path, home.join("work/repo"));
        }

        env::remove_var("BINSYNC_USER");
        env::remove_var("BINSYNC_REPO");
        env::remove_var("BINSYNC_EMAIL");
        Ok(())
    }
}
