use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persistent bridge configuration; command-line flags override it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Default adapter variant: "subprocess" or "native-stream".
    #[serde(default)]
    pub default_backend: Option<String>,

    /// Backend CLI binary for the subprocess variant.
    #[serde(default)]
    pub claude_binary: Option<PathBuf>,

    /// Extra arguments appended to every CLI spawn.
    #[serde(default)]
    pub claude_args: Vec<String>,

    /// Credential marker checked before spawning the CLI.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Thread-protocol endpoint (host:port) for the native-stream variant.
    #[serde(default)]
    pub thread_addr: Option<String>,

    /// Where notification history lives; platform config dir by default.
    #[serde(default)]
    pub history_dir: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = directories::ProjectDirs::from("com", "acp-bridge", "acp-bridge")
            .context("Failed to determine config directory")?
            .config_dir()
            .to_path_buf();
        Ok(config_dir.join("config.json"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    /// Save via temp file + rename so a crash never leaves a torn config.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &contents).context("Failed to write temp config file")?;
        fs::rename(&temp_path, &path).context("Failed to rename config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_object() {
        let config: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert!(config.default_backend.is_none());
        assert!(config.claude_args.is_empty());
        assert!(config.history_dir.is_none());
    }

    #[test]
    fn roundtrip() {
        let config = BridgeConfig {
            default_backend: Some("subprocess".to_string()),
            claude_binary: Some(PathBuf::from("/usr/local/bin/claude")),
            claude_args: vec!["--verbose".to_string()],
            credentials_path: None,
            thread_addr: Some("127.0.0.1:9300".to_string()),
            history_dir: None,
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.default_backend.as_deref(), Some("subprocess"));
        assert_eq!(parsed.claude_args, vec!["--verbose"]);
        assert_eq!(parsed.thread_addr.as_deref(), Some("127.0.0.1:9300"));
    }
}
