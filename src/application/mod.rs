pub mod download_manager;

pub use download_manager::{DownloadManager, DownloadPhase, DownloadState, SaveDownload};
