use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration for the layer core. Loaded once at instance
/// creation and treated as read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Overlap the compositor's blocking frame wait with app render work.
    pub turbo_mode: bool,
    /// Runtimes (matched by substring of the runtime name) that recycle a
    /// swapchain image as soon as it is released, forcing us to hold the
    /// release back until the next frame has been composited.
    pub deferred_release_runtimes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            turbo_mode: false,
            deferred_release_runtimes: vec!["Varjo".to_owned()],
        }
    }
}

/// One settings file. All fields are optional so that a later file only
/// overrides what it actually mentions.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    turbo_mode: Option<bool>,
    deferred_release_runtimes: Option<Vec<String>>,
}

impl Settings {
    /// Loads the file shipped with the layer (if any), then the user's file,
    /// later files winning per field. A missing or unparseable file is not an
    /// error; the defaults stand in for it.
    pub fn load(shipped: Option<&Path>) -> Self {
        let mut settings = Self::default();
        if let Some(path) = shipped {
            settings.apply_file(path);
        }
        if let Some(path) = user_settings_path() {
            settings.apply_file(&path);
        }
        settings
    }

    pub fn needs_deferred_swapchain_release(&self, runtime_name: &str) -> bool {
        let name = runtime_name.to_lowercase();
        self.deferred_release_runtimes
            .iter()
            .any(|quirked| name.contains(&quirked.to_lowercase()))
    }

    fn apply_file(&mut self, path: &Path) {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                debug!("Not reading settings from {path:?}: {e}");
                return;
            }
        };

        match serde_json::from_slice::<SettingsFile>(&data) {
            Ok(file) => {
                debug!("Applying settings from {path:?}");
                self.apply(file);
            }
            Err(e) => warn!("Ignoring malformed settings file {path:?}: {e}"),
        }
    }

    fn apply(&mut self, file: SettingsFile) {
        if let Some(turbo_mode) = file.turbo_mode {
            self.turbo_mode = turbo_mode;
        }
        if let Some(runtimes) = file.deferred_release_runtimes {
            self.deferred_release_runtimes = runtimes;
        }
    }
}

fn user_settings_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .or_else(|_| std::env::var("HOME").map(|h| h + "/.config"))
        .ok()?;
    Some(Path::new(&config_dir).join("quadrizer").join("settings.json"))
}
