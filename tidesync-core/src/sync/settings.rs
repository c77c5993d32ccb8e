//! Sync configuration surface. Consumed by the engine and scheduler, owned
//! by the host application.

use serde::{Deserialize, Serialize};

/// Sync configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Only sync on unmetered (Wi-Fi) networks.
    pub wifi_only: bool,
    /// Periodic sync interval in minutes.
    pub sync_frequency_minutes: u64,
    pub sync_connections: bool,
    pub sync_keys: bool,
    pub sync_settings: bool,
    pub sync_themes: bool,
    /// Resolve timestamped conflicts last-write-wins instead of pausing.
    pub auto_resolve_conflicts: bool,
    pub requires_charging: bool,
    pub battery_not_low: bool,
    /// Request a sync after a quiet period following local edits.
    pub sync_on_change: bool,
    /// Quiet period for change-triggered sync, in seconds.
    pub debounce_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            wifi_only: true,
            sync_frequency_minutes: 60,
            sync_connections: true,
            sync_keys: true,
            sync_settings: true,
            sync_themes: true,
            auto_resolve_conflicts: false,
            requires_charging: false,
            battery_not_low: true,
            sync_on_change: true,
            debounce_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = SyncSettings::default();
        assert!(!settings.enabled);
        assert!(settings.wifi_only);
        assert_eq!(settings.sync_frequency_minutes, 60);
        assert_eq!(settings.debounce_secs, 30);
        assert!(!settings.auto_resolve_conflicts);
    }

    #[test]
    fn settings_roundtrip() {
        let mut settings = SyncSettings::default();
        settings.enabled = true;
        settings.wifi_only = false;

        let json = serde_json::to_string(&settings).unwrap();
        let back: SyncSettings = serde_json::from_str(&json).unwrap();
        assert!(back.enabled);
        assert!(!back.wifi_only);
    }
}
