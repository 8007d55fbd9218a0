use std::{error::Error, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::models::Settings;

/// Loads and saves `settings.json` in the app directory
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    settings_file_path: PathBuf,
}

impl SettingsHandler {
    pub fn new(app_dir: PathBuf) -> Self {
        Self { settings_file_path: app_dir.join("settings.json") }
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_file_path
    }

    /// Settings for this run. A missing file is created with the defaults, an unreadable
    /// one is reported and replaced by the defaults in memory only.
    #[instrument(skip(self))]
    pub fn load(&self) -> Arc<Settings> {
        let settings = match self.load_settings() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults.");
                Settings::default()
            }
        };
        debug!(settings = ?settings, "Active settings");
        Arc::new(settings)
    }

    /// Load settings from file, writing the defaults if it doesn't exist
    #[instrument(skip(self))]
    fn load_settings(&self) -> Result<Settings> {
        if !self.settings_file_path.exists() {
            info!(path = %self.settings_file_path.display(), "Settings file doesn't exist, using defaults");
            let settings = Settings::default();
            self.save_settings(&settings)?;
            return Ok(settings);
        }

        info!(path = %self.settings_file_path.display(), "Loading settings from file");
        let file_content = fs_err::read_to_string(&self.settings_file_path)
            .context("Failed to read settings file")?;
        let settings: Settings =
            serde_json::from_str(&file_content).context("Failed to parse settings file")?;
        debug!("Loaded application settings successfully");
        Ok(settings)
    }

    /// Save settings to file
    #[instrument(skip(self, settings))]
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        info!(path = %self.settings_file_path.display(), "Saving settings to file");
        let settings_json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        if let Some(parent) = self.settings_file_path.parent()
            && !parent.exists()
        {
            info!(path = %parent.display(), "Creating settings directory");
            fs_err::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        fs_err::write(&self.settings_file_path, settings_json)
            .context("Failed to write settings file")?;
        info!("Saved application settings successfully");
        Ok(())
    }
}
