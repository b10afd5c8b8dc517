use anyhow::Result;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::config::DEFAULT_CHAIN_ID;

const SETTINGS_FILE: &str = "xburn_settings.json";

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

/// User settings that persist between sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    /// Selected network chain ID
    #[serde(default = "default_chain_id")]
    pub selected_chain_id: u64,
    /// Custom RPC overrides per chain ID
    #[serde(default)]
    pub custom_rpcs: HashMap<u64, String>,
    /// Whether a wallet was connected when the previous session ended.
    /// Drives a silent reconnection attempt at startup.
    #[serde(default)]
    pub was_connected: bool,
    /// Account used in the previous session
    #[serde(default)]
    pub last_account: Option<Address>,
    /// Optional address book file layered over the built-in contract table
    #[serde(default)]
    pub address_book_path: Option<PathBuf>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            selected_chain_id: default_chain_id(),
            custom_rpcs: HashMap::new(),
            was_connected: false,
            last_account: None,
            address_book_path: None,
        }
    }
}

impl UserSettings {
    /// Directory where app data is stored
    pub fn app_data_dir() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            let app_dir = config_dir.join("xburn-sync");
            if !app_dir.exists() {
                let _ = fs::create_dir_all(&app_dir);
            }
            app_dir
        } else {
            PathBuf::from(".")
        }
    }

    fn settings_path() -> PathBuf {
        Self::app_data_dir().join(SETTINGS_FILE)
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        let path = Self::settings_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => {
                        tracing::info!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse settings file: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read settings file: {}", e);
                }
            }
        }
        tracing::info!("Using default settings");
        Self::default()
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Get custom RPC for a chain, or None if using default
    pub fn get_custom_rpc(&self, chain_id: u64) -> Option<&String> {
        self.custom_rpcs.get(&chain_id).filter(|s| !s.is_empty())
    }

    /// Set custom RPC for a chain (empty string removes the override)
    pub fn set_custom_rpc(&mut self, chain_id: u64, rpc: String) {
        if rpc.trim().is_empty() {
            self.custom_rpcs.remove(&chain_id);
        } else {
            self.custom_rpcs.insert(chain_id, rpc.trim().to_string());
        }
    }

    /// Record a successful connection so the next session reconnects silently.
    pub fn mark_connected(&mut self, account: Address) {
        self.was_connected = true;
        self.last_account = Some(account);
    }

    /// Record an explicit user disconnect. Silent reconnection is skipped afterwards.
    pub fn mark_disconnected(&mut self) {
        self.was_connected = false;
    }

    /// Account to reconnect silently at startup, if any.
    pub fn reconnect_account(&self) -> Option<Address> {
        if self.was_connected {
            self.last_account
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_settings_default_values() {
        let settings = UserSettings::default();
        assert_eq!(settings.selected_chain_id, DEFAULT_CHAIN_ID);
        assert!(settings.custom_rpcs.is_empty());
        assert!(!settings.was_connected);
        assert!(settings.last_account.is_none());
    }

    #[test]
    fn test_set_and_get_custom_rpc() {
        let mut settings = UserSettings::default();
        settings.set_custom_rpc(1, "  https://my-eth-node.com  ".to_string());
        assert_eq!(settings.get_custom_rpc(1).unwrap(), "https://my-eth-node.com");
    }

    #[test]
    fn test_set_custom_rpc_whitespace_removes() {
        let mut settings = UserSettings::default();
        settings.set_custom_rpc(1, "https://my-eth-node.com".to_string());
        settings.set_custom_rpc(1, "   ".to_string());
        assert!(settings.get_custom_rpc(1).is_none());
    }

    #[test]
    fn test_reconnect_account_follows_connection_flag() {
        let account = Address::from_low_u64_be(0xa);
        let mut settings = UserSettings::default();
        assert!(settings.reconnect_account().is_none());

        settings.mark_connected(account);
        assert_eq!(settings.reconnect_account(), Some(account));

        settings.mark_disconnected();
        assert!(settings.reconnect_account().is_none());
        assert_eq!(settings.last_account, Some(account));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: UserSettings = serde_json::from_str(r#"{"was_connected": true}"#).unwrap();
        assert!(settings.was_connected);
        assert_eq!(settings.selected_chain_id, DEFAULT_CHAIN_ID);
    }
}
