//! Settings file

use std::path::{Path, PathBuf};

use meshlink_core::MeshConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub mesh: MeshConfig,

    /// Where the settings were loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    pub fn new(mesh: MeshConfig) -> Self {
        Self {
            mesh,
            config_path: None,
        }
    }

    /// Load settings from `path`; the file must exist
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
        let mut settings: Settings = serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
        settings.config_path = Some(path.to_path_buf());
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Load settings from `path`, or defaults bound to `path` if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.to_path_buf());
            Ok(settings)
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::{RelayType, TunnelProtocolType};

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("meshlink-settings-{}-{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.mesh.proxy.listen_port, 1080);
        assert_eq!(settings.mesh.proxy.deny_protocols, TunnelProtocolType::QUIC);
        assert!(settings.mesh.tunnel.transports.is_empty());
        assert!(settings.config_path().is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = scratch("missing");
        let settings = Settings::load_or_default(&path).unwrap();
        assert_eq!(settings.config_path(), Some(path.as_path()));
        assert!(matches!(Settings::load(&path), Err(SettingsError::ReadError(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let path = scratch("roundtrip");
        let mut settings = Settings::load_or_default(&path).unwrap();
        settings.mesh.node.machine_id = "m-1".to_string();
        settings.mesh.relay.server.relay_type = RelayType::Node;
        settings.mesh.proxy.listen_port = 1081;
        settings.save().unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.mesh.node.machine_id, "m-1");
        assert_eq!(loaded.mesh.relay.server.relay_type, RelayType::Node);
        assert_eq!(loaded.mesh.proxy.listen_port, 1081);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = scratch("partial");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"node":{"machine_id":"m-2"},"proxy":{"listen_port":9000}}"#).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.mesh.node.machine_id, "m-2");
        assert_eq!(loaded.mesh.proxy.listen_port, 9000);
        assert_eq!(loaded.mesh.proxy.udp_idle_timeout_secs, 60);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::ParseError(_))));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
