use std::path::Path;

use crate::error::Result;
use crate::settings::Settings;
use crate::utils::os;

/// Show the download folder in the platform file browser.
pub fn open_download_folder(settings: &Settings) -> Result<()> {
    let dir = Path::new(&settings.download_directory);
    tracing::debug!("opening {}", dir.display());
    os::open_directory(dir)?;
    Ok(())
}
