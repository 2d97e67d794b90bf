/*
src/downloader.rs

full download of an evidence folder's content, which the binary matcher later compares pieces against.

re-entry is cheap: a .download_skip marker or content already at its declared size ends the run before the
torrent is attached. a transfer whose verified byte count does not move for the stall window is given up.
*/

use crate::clock::Clock;
use crate::config::Settings;
use crate::engine::{AddTorrentParams, Session, StorageMode, TorrentHandle};
use crate::evidence::DOWNLOAD_SKIP_MARKER;
use crate::locale::Text;
use crate::poll::{BoundedPoll, Budget, Pacer, PollOutcome};
use crate::torrent::TorrentDescriptor;
use anyhow::{Context, Result};
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// the folder carries a skip marker
    Skipped,
    AlreadyComplete,
    Completed,
    Stalled,
    /// cancelled or past the run deadline
    Interrupted,
}

impl DownloadOutcome {
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            DownloadOutcome::Skipped | DownloadOutcome::AlreadyComplete | DownloadOutcome::Completed
        )
    }
}

/// size of a file, or of every file below a folder
fn size_on_disk(path: &Path) -> io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += size_on_disk(&entry?.path())?;
    }
    Ok(total)
}

enum Step {
    Finished,
    Stalled,
    Failed(anyhow::Error),
}

pub struct Downloader<'a> {
    settings: &'a Settings,
    pacer: &'a dyn Pacer,
    clock: &'a dyn Clock,
}

impl<'a> Downloader<'a> {
    pub fn new(settings: &'a Settings, pacer: &'a dyn Pacer, clock: &'a dyn Clock) -> Downloader<'a> {
        Downloader {
            settings,
            pacer,
            clock,
        }
    }

    pub fn run<S: Session>(
        &self,
        session: &S,
        torrent: &Arc<TorrentDescriptor>,
        folder: &Path,
        budget: &Budget,
    ) -> Result<DownloadOutcome> {
        let locale = self.settings.locale;
        if folder.join(DOWNLOAD_SKIP_MARKER).exists() {
            log::info!("{}: {}", locale.text(Text::DownloadSkipped), folder.display());
            return Ok(DownloadOutcome::Skipped);
        }
        let content = torrent.content_path(folder);
        if size_on_disk(&content).is_ok_and(|size| size == torrent.total_length()) {
            log::info!("{}: {}", locale.text(Text::DownloadAlreadyDone), content.display());
            return Ok(DownloadOutcome::AlreadyComplete);
        }

        log::info!("{}: {}", locale.text(Text::DownloadStarting), torrent.name());
        let handle = session
            .add_torrent(AddTorrentParams::new(torrent.clone(), folder, StorageMode::Disk))
            .with_context(|| format!("adding {} for download", torrent.name()))?;
        handle.set_upload_limit(self.settings.max_upload_limit * 1024);

        let stall_window = self.settings.stall_window();
        let mut last_done = None;
        let mut last_change = self.pacer.elapsed();
        let poll = BoundedPoll::unbounded(self.settings.download_poll_interval());
        let outcome = poll.run(self.pacer, budget, |_| {
            let status = match handle.status() {
                Ok(status) => status,
                Err(err) => return ControlFlow::Break(Step::Failed(err)),
            };
            if status.is_seeding() {
                return ControlFlow::Break(Step::Finished);
            }
            let now = self.pacer.elapsed();
            if last_done != Some(status.total_done) {
                last_done = Some(status.total_done);
                last_change = now;
            } else if now.saturating_sub(last_change) >= stall_window {
                return ControlFlow::Break(Step::Stalled);
            }
            log::debug!(
                "{}: {:.1}% ({} peers)",
                torrent.name(),
                status.progress * 100.0,
                status.num_peers
            );
            ControlFlow::Continue(())
        });
        session.remove_torrent(&handle);

        match outcome {
            PollOutcome::Done(Step::Finished) => {
                log::info!(
                    "{}: {} {} bytes {}",
                    locale.text(Text::DownloadComplete),
                    torrent.info_hash_hex(),
                    torrent.total_length(),
                    self.clock.timestamp()
                );
                Ok(DownloadOutcome::Completed)
            }
            PollOutcome::Done(Step::Stalled) => {
                log::warn!(
                    "{} ({} s without progress)",
                    locale.text(Text::DownloadStalled),
                    stall_window.as_secs()
                );
                Ok(DownloadOutcome::Stalled)
            }
            PollOutcome::Done(Step::Failed(err)) => Err(err.context("polling download status")),
            PollOutcome::Exhausted | PollOutcome::Cancelled | PollOutcome::DeadlineExceeded => {
                log::info!("download of {} interrupted", torrent.name());
                Ok(DownloadOutcome::Interrupted)
            }
        }
    }
}
