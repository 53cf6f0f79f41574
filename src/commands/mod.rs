pub mod apply;
pub mod query;

use wslkit::Reconciler;
use wslkit::exec::ProcessExecutor;
use wslkit::fetch::{ArtifactFetcher, HttpTransport};

use crate::config::Settings;

/// Build a reconciler that drives the real `wsl.exe`
pub fn reconciler(settings: &Settings) -> Reconciler {
    let staging = settings.staging_root();
    log::debug!("Staging root: {}", staging.display());

    let fetcher = match settings.download_timeout() {
        Some(timeout) => {
            ArtifactFetcher::with_transport(staging, Box::new(HttpTransport::new(timeout)))
        }
        None => ArtifactFetcher::new(staging),
    };

    Reconciler::new(Box::new(ProcessExecutor::new()), fetcher)
}
