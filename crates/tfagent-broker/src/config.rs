//! Configuration loading from `~/.tfagent/config.toml` with defaults.

use std::path::{Path, PathBuf};
use tfagent_types::config::BrokerConfig;
use tracing::{info, warn};

/// Load broker configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is logged and replaced by
/// [`BrokerConfig::default`]. A relative `identity_key` is resolved against
/// the directory holding the config file.
pub fn load_config(path: Option<&Path>) -> BrokerConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BrokerConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return BrokerConfig::default();
        }
    };

    match toml::from_str::<BrokerConfig>(&contents) {
        Ok(mut config) => {
            if let Some(key) = config.identity_key.as_mut() {
                if key.is_relative() {
                    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
                    *key = base.join(&*key);
                }
            }
            info!(
                path = %config_path.display(),
                twins = config.twins.len(),
                "Loaded configuration"
            );
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            BrokerConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    tfagent_home().join("config.toml")
}

/// Get the default tfagent home directory.
pub fn tfagent_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tfagent")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tfagent_types::config::DEFAULT_CLIENT_PORT;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config.listen_addr.port(), DEFAULT_CLIENT_PORT);
        assert!(config.twins.is_empty());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "listen_addr = \"127.0.0.1:9999\"").unwrap();
        writeln!(f, "identity_key = \"seed.hex\"").unwrap();
        writeln!(f, "[node]").unwrap();
        writeln!(f, "send_timeout_secs = 5").unwrap();
        writeln!(f, "[[twins]]").unwrap();
        writeln!(f, "id = 7").unwrap();
        writeln!(
            f,
            "public_key = \"74856cfef93872537edaebd19504e6494beabc33f61abac91da7301f0f37f655\""
        )
        .unwrap();
        drop(f);

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr.port(), 9999);
        assert_eq!(config.node.send_timeout_secs, 5);
        assert_eq!(config.node.message_ttl_secs, 3600);
        assert_eq!(config.twins.len(), 1);
        assert_eq!(config.twins[0].id, 7);
        assert_eq!(config.identity_key, Some(dir.path().join("seed.hex")));
    }

    #[test]
    fn test_absolute_identity_key_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "identity_key = \"/etc/tfagent/seed.hex\"\n").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(
            config.identity_key,
            Some(PathBuf::from("/etc/tfagent/seed.hex"))
        );
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen_addr = 42\n[node\n").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr.port(), DEFAULT_CLIENT_PORT);
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".tfagent/config.toml"));
    }
}
