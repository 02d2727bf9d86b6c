use std::{error::Error, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use rinf::{DartSignal, RustSignal};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use crate::models::{Settings, signals::settings::*};

/// Handles application settings
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    settings_file_path: PathBuf,
    watch_tx: watch::Sender<Settings>,
}

impl SettingsHandler {
    fn with_file(settings_file_path: PathBuf) -> Self {
        Self { settings_file_path, watch_tx: watch::Sender::new(Settings::default()) }
    }

    #[instrument(skip(app_dir))]
    pub fn new(app_dir: PathBuf) -> Arc<Self> {
        let handler = Arc::new(Self::with_file(app_dir.join("settings.json")));

        let settings = handler.load_settings().unwrap_or_else(|e| {
            warn!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults.");
            handler.load_default_settings()
        });
        handler.on_settings_change(settings, None);

        tokio::spawn(
            {
                let handler = handler.clone();
                async move {
                    handler.receive_settings_requests().await;
                }
            }
            .instrument(info_span!("task_receive_settings_requests")),
        );

        handler
    }

    async fn receive_settings_requests(&self) {
        let load_receiver = LoadSettingsRequest::get_dart_signal_receiver();
        let save_receiver = SaveSettingsRequest::get_dart_signal_receiver();

        info!("Starting to listen for settings requests");

        loop {
            tokio::select! {
                Some(_) = load_receiver.recv() => {
                    info!("Received LoadSettingsRequest");
                    match self.load_settings() {
                        Ok(settings) => self.on_settings_change(settings, None),
                        Err(e) => {
                            error!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults");
                            let settings = self.load_default_settings();
                            self.on_settings_change(
                                settings,
                                Some(format!("Failed to load settings: {e:#}")),
                            );
                        }
                    }
                },
                Some(signal_pack) = save_receiver.recv() => {
                    info!("Received SaveSettingsRequest");
                    let settings = signal_pack.message.settings;
                    match self.validate_and_save(&settings) {
                        Ok(()) => {
                            self.on_settings_change(settings, None);
                            SettingsSavedEvent { error: None }.send_signal_to_dart();
                        }
                        Err(e) => {
                            error!(error = e.as_ref() as &dyn Error, "Failed to save settings");
                            SettingsSavedEvent {
                                error: Some(format!("Failed to save settings: {e:#}")),
                            }
                            .send_signal_to_dart();
                        }
                    }
                },
                else => {
                    error!("All settings request channels closed");
                    break;
                }
            }
        }
        panic!("Settings request receiver loop ended");
    }

    /// Publishes `settings` if they differ from the active ones
    #[instrument(skip(self, settings, error))]
    fn on_settings_change(&self, settings: Settings, error: Option<String>) {
        trace!("on_settings_change called");
        self.watch_tx.send_if_modified(|s| {
            if s != &settings {
                debug!(settings = ?settings, "Active settings changed");
                *s = settings.clone();
                SettingsChangedEvent { settings, error }.send_signal_to_dart();
                true
            } else {
                trace!("Settings unchanged, not sending event");
                false
            }
        });
    }

    /// Create a receiver for settings changes
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.watch_tx.subscribe()
    }

    /// Load settings from file or return defaults if file doesn't exist
    #[instrument(skip(self))]
    fn load_settings(&self) -> Result<Settings> {
        if !self.settings_file_path.exists() {
            info!(path = %self.settings_file_path.display(), "Settings file doesn't exist, using defaults");
            return Ok(self.load_default_settings());
        }

        info!(path = %self.settings_file_path.display(), "Loading settings from file");
        let file_content =
            fs::read_to_string(&self.settings_file_path).context("Failed to read settings file")?;

        let settings: Settings =
            serde_json::from_str(&file_content).context("Failed to parse settings file")?;

        if let Err(e) = settings.provision_target() {
            warn!(error = &e as &dyn Error, "Loaded settings are invalid, actions will fail");
        }
        debug!("Loaded application settings successfully");
        Ok(settings)
    }

    /// Rejects settings whose package or admin receiver could never work, then saves them
    fn validate_and_save(&self, settings: &Settings) -> Result<()> {
        settings.provision_target()?;
        self.save_settings(settings)
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
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        fs::write(&self.settings_file_path, settings_json)
            .context("Failed to write settings file")?;

        info!("Saved application settings successfully");
        Ok(())
    }

    /// Returns the default settings and writes them to the settings file
    #[instrument(skip(self))]
    fn load_default_settings(&self) -> Settings {
        info!("Loading default settings");
        let settings = Settings::default();
        match self.save_settings(&settings) {
            Ok(()) => info!("Default settings loaded and saved"),
            Err(e) => warn!(error = e.as_ref() as &dyn Error, "Failed to save default settings"),
        }
        settings
    }
}
