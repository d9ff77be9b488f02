use std::path::Path;

use crate::download::consumer::EventConsumer;
use crate::download::manager::DownloadManager;
use crate::error::Result;
use crate::settings::{self, Settings};

pub async fn save_settings(
    path: &Path,
    manager: &DownloadManager,
    consumer: &mut EventConsumer,
    settings: Settings,
) -> Result<()> {
    // persist first
    settings::save_settings_to(path, &settings)?;

    // then live-toggle logging
    crate::logging::set_file_logging_enabled(settings.debug_logs);
    tracing::info!("settings saved; debug_logs now {}", settings.debug_logs);

    // retry policy and history file apply to the next event
    consumer.apply_settings(&settings);

    // the next job picks these up
    manager.update_settings(settings).await
}
