use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

use crate::utils::sanitize_filename;

/// Snapshot of one download, delivered to observers on every state mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadState {
    pub url: Url,
    pub phase: DownloadPhase,
    /// Fraction of expected bytes written, in `[0, 1]`. Stays at 0 when the
    /// server does not announce a length.
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    PausedByUser,
    /// The transfer failed mid-flight. All such failures are assumed to be
    /// transient connectivity loss; the entry keeps its progress and resumes
    /// on the next `start`.
    WaitingForConnection,
    InProgress,
    Cancelled,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Pause,
    Cancel,
}

enum Outcome {
    Finished,
    Paused,
    Cancelled,
}

#[derive(Debug, Error)]
enum TransferError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Entry {
    state: DownloadState,
    control: watch::Sender<Command>,
    part_path: PathBuf,
}

/// Persists a finished download from its temporary path into caller-owned
/// storage. Runs before the entry is removed.
pub type SaveDownload = dyn Fn(&Url, &Path) + Send + Sync;

/// Drives resumable background downloads, one state entry per source URL.
///
/// Every mutation emits one immutable `DownloadState` snapshot on the event
/// channel returned by [`DownloadManager::new`]. Pausing or cancelling a URL
/// with no active download is a programmer error and panics.
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    downloads_dir: PathBuf,
    entries: Mutex<HashMap<Url, Entry>>,
    events: mpsc::UnboundedSender<DownloadState>,
    save: Box<SaveDownload>,
}

impl DownloadManager {
    pub fn new(
        downloads_dir: impl Into<PathBuf>,
        save: impl Fn(&Url, &Path) + Send + Sync + 'static,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadState>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::new(),
                downloads_dir: downloads_dir.into(),
                entries: Mutex::new(HashMap::new()),
                events,
                save: Box::new(save),
            }),
        };
        (manager, receiver)
    }

    /// Starts a download, or resumes a paused/interrupted one. Progress from
    /// a prior attempt is preserved.
    pub fn start(&self, url: Url) {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(&url) {
            // The send fails when the worker has already exited; the entry
            // is stale and the download starts over below.
            Some(entry) if entry.control.send(Command::Run).is_ok() => {
                entry.state.phase = DownloadPhase::InProgress;
                let snapshot = entry.state.clone();
                drop(entries);
                self.inner.notify(snapshot);
                return;
            }
            Some(_) => {
                entries.remove(&url);
            }
            None => {}
        }

        let (control, commands) = watch::channel(Command::Run);
        let part_path = self.inner.part_path(&url);
        let state = DownloadState {
            url: url.clone(),
            phase: DownloadPhase::InProgress,
            progress: 0.0,
        };
        entries.insert(
            url.clone(),
            Entry {
                state: state.clone(),
                control,
                part_path: part_path.clone(),
            },
        );
        drop(entries);
        self.inner.notify(state);

        info!(%url, "starting download");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(url, part_path, commands).await });
    }

    /// Suspends the transfer. Panics when no download is active for `url`.
    pub fn pause(&self, url: &Url) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(url) else {
            panic!("no active download for {url}");
        };
        let _ = entry.control.send(Command::Pause);
        entry.state.phase = DownloadPhase::PausedByUser;
        let snapshot = entry.state.clone();
        drop(entries);
        self.inner.notify(snapshot);
    }

    /// Cancels the transfer, removing the entry and the partial file.
    /// Panics when no download is active for `url`.
    pub fn cancel(&self, url: &Url) {
        let mut entries = self.inner.entries.lock();
        let Some(mut entry) = entries.remove(url) else {
            panic!("no active download for {url}");
        };
        drop(entries);
        let _ = entry.control.send(Command::Cancel);
        entry.state.phase = DownloadPhase::Cancelled;
        let _ = fs::remove_file(&entry.part_path);
        self.inner.notify(entry.state);
    }
}

impl Inner {
    fn part_path(&self, url: &Url) -> PathBuf {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("download");
        self.downloads_dir.join(format!("{}.part", sanitize_filename(name)))
    }

    fn notify(&self, state: DownloadState) {
        let _ = self.events.send(state);
    }

    /// Mutates the tracked state for `url` and emits the new snapshot.
    /// No-op when the entry has been removed concurrently.
    fn modify_state(&self, url: &Url, transform: impl FnOnce(&mut DownloadState)) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(url) else {
            return;
        };
        transform(&mut entry.state);
        let snapshot = entry.state.clone();
        drop(entries);
        self.notify(snapshot);
    }

    fn note_progress(&self, url: &Url, written: u64, expected: Option<u64>) {
        let progress = match expected {
            Some(total) if total > 0 => written as f64 / total as f64,
            _ => 0.0,
        };
        self.modify_state(url, |state| {
            state.phase = DownloadPhase::InProgress;
            state.progress = progress;
        });
    }

    async fn run(
        self: Arc<Self>,
        url: Url,
        part_path: PathBuf,
        mut commands: watch::Receiver<Command>,
    ) {
        let mut written: u64 = 0;
        loop {
            match self.transfer(&url, &part_path, &mut written, &mut commands).await {
                Ok(Outcome::Finished) => {
                    self.modify_state(&url, |state| {
                        state.phase = DownloadPhase::Finished;
                        state.progress = 1.0;
                    });
                    (self.save)(&url, &part_path);
                    self.entries.lock().remove(&url);
                    info!(%url, "download finished");
                    return;
                }
                Ok(Outcome::Cancelled) => return,
                Ok(Outcome::Paused) => {
                    if self.wait_for_resume(&mut commands).await == Command::Cancel {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%url, error = %err, "transfer interrupted, waiting for connection");
                    self.modify_state(&url, |state| {
                        state.phase = DownloadPhase::WaitingForConnection;
                    });
                    if self.wait_for_resume(&mut commands).await == Command::Cancel {
                        return;
                    }
                }
            }
        }
    }

    /// One attempt at transferring the remainder of the file. Resumes from
    /// `written` with a range request when a prior attempt made progress;
    /// appending requires a 206, and any non-success status is a transfer
    /// failure.
    async fn transfer(
        &self,
        url: &Url,
        part_path: &Path,
        written: &mut u64,
        commands: &mut watch::Receiver<Command>,
    ) -> Result<Outcome, TransferError> {
        let mut request = self.client.get(url.clone());
        let ranged = *written > 0;
        if ranged {
            request = request.header(RANGE, format!("bytes={written}-"));
        }
        let response = request.send().await?.error_for_status()?;
        if ranged && response.status() != StatusCode::PARTIAL_CONTENT {
            // The server ignored the range request; restart from byte zero
            // instead of appending a second full copy.
            warn!(%url, status = %response.status(), "range request ignored, restarting transfer");
            *written = 0;
        }
        let expected = response.content_length().map(|remaining| *written + remaining);

        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let mut file = if *written > 0 {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(part_path)
                .await?
        } else {
            tokio::fs::File::create(part_path).await?
        };
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            match *commands.borrow() {
                Command::Cancel => return Ok(Outcome::Cancelled),
                Command::Pause => return Ok(Outcome::Paused),
                Command::Run => {}
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            self.note_progress(url, *written, expected);
        }
        file.sync_all().await?;
        Ok(Outcome::Finished)
    }

    /// Parks until the user resumes or cancels. The connection is dropped
    /// while parked; resuming issues a fresh ranged request.
    async fn wait_for_resume(&self, commands: &mut watch::Receiver<Command>) -> Command {
        loop {
            if commands.changed().await.is_err() {
                return Command::Cancel;
            }
            match *commands.borrow_and_update() {
                Command::Run => return Command::Run,
                Command::Cancel => return Command::Cancel,
                Command::Pause => {}
            }
        }
    }
}
