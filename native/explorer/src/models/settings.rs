use serde::{Deserialize, Serialize};

/// Which transport implementation talks to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportBackend {
    /// Spawn the `adb` executable per command
    #[default]
    Process,
    /// Keep a connection to the adb server per device
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Path or name of the adb executable
    pub adb_path: String,
    pub backend: TransportBackend,
    /// Wrap shell commands in `su -c`
    pub run_privileged: bool,
    /// Keep remote modification times on download
    pub preserve_timestamps: bool,
    pub downloads_location: String,
    pub kill_server_at_exit: bool,
    /// adb server port used by the session backend
    pub server_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            backend: TransportBackend::Process,
            run_privileged: false,
            preserve_timestamps: true,
            downloads_location: dirs::download_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_default()
                .join("ADB Explorer")
                .to_string_lossy()
                .to_string(),
            kill_server_at_exit: false,
            server_port: 5037,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "backend": "session", "run_privileged": true }"#).unwrap();
        assert_eq!(settings.backend, TransportBackend::Session);
        assert!(settings.run_privileged);
        assert_eq!(settings.adb_path, "adb");
        assert_eq!(settings.server_port, 5037);
    }
}
