pub mod downloader;
pub mod files;
pub mod settings_cmd;
