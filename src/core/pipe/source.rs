//! Push-based sources feeding a `StreamToQueuePipe`.
//!
//! A source delivers `SourceEvent`s over a channel and accepts a best-effort
//! pause/resume hint through `SourceControl`. Nothing forces a source to honor
//! the hint; if it keeps emitting, items keep queueing.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::core::error::ConfigError;

#[derive(Debug)]
pub enum SourceEvent<T> {
    Data(T),
    End,
    Error(anyhow::Error),
}

/// Pause/resume hint a pipe sends back to its source.
pub trait SourceControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Event stream plus control handle of one source.
pub struct PushSource<T> {
    events: mpsc::UnboundedReceiver<SourceEvent<T>>,
    control: Arc<dyn SourceControl>,
}

impl<T> PushSource<T> {
    pub fn new(
        events: mpsc::UnboundedReceiver<SourceEvent<T>>,
        control: Arc<dyn SourceControl>,
    ) -> Self {
        Self { events, control }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<SourceEvent<T>>,
        Arc<dyn SourceControl>,
    ) {
        (self.events, self.control)
    }
}

/// Shared paused flag. Sources poll it between emissions.
#[derive(Debug, Clone)]
pub struct PauseFlag {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseFlag {
    fn default() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
        }
    }
}

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Resolves immediately unless paused, otherwise once resumed.
    pub async fn resumed(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl SourceControl for PauseFlag {
    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }
}

/// Producer side of a channel-backed source.
#[derive(Debug)]
pub struct SourceHandle<T> {
    events: mpsc::UnboundedSender<SourceEvent<T>>,
    flag: PauseFlag,
}

impl<T> Clone for SourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            flag: self.flag.clone(),
        }
    }
}

impl<T> SourceHandle<T> {
    /// Emits one item. `false` once the consuming pipe is gone.
    pub fn send(&self, data: T) -> bool {
        self.events.send(SourceEvent::Data(data)).is_ok()
    }

    pub fn end(&self) {
        let _ = self.events.send(SourceEvent::End);
    }

    pub fn fail(&self, err: impl Into<anyhow::Error>) {
        let _ = self.events.send(SourceEvent::Error(err.into()));
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.flag.is_paused()
    }

    pub async fn resumed(&self) {
        self.flag.resumed().await
    }

    /// Resolves once the consuming pipe has dropped its end.
    pub async fn closed(&self) {
        self.events.closed().await
    }

    /// Waits out a pause. `false` if the consumer went away meanwhile, in
    /// which case the producer should stop.
    pub async fn ready(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.closed() => false,
            _ = self.resumed() => true,
        }
    }
}

/// Creates a hand-fed source. The handle reports the pause hint the pipe
/// sends back.
pub fn push_source<T>() -> (SourceHandle<T>, PushSource<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flag = PauseFlag::new();
    let control: Arc<dyn SourceControl> = Arc::new(flag.clone());
    (
        SourceHandle { events: tx, flag },
        PushSource::new(rx, control),
    )
}

/// A slice of a file and where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u64,
    pub data: Bytes,
}

/// Spawns a reader emitting `path` from `offset` in chunks of at most
/// `chunk_size` bytes. Reading stops while paused.
pub fn file_source(
    path: impl AsRef<Path>,
    offset: u64,
    chunk_size: usize,
) -> Result<PushSource<FileChunk>, ConfigError> {
    if chunk_size == 0 {
        return Err(ConfigError::InvalidChunkSize(chunk_size));
    }

    let path: PathBuf = path.as_ref().to_path_buf();
    let (handle, source) = push_source();
    tokio::spawn(async move {
        if let Err(err) = read_chunks(&path, offset, chunk_size, &handle).await {
            debug!(path = %path.display(), error = %err, "file source failed");
            handle.fail(err);
        }
    });
    Ok(source)
}

async fn read_chunks(
    path: &Path,
    mut offset: u64,
    chunk_size: usize,
    handle: &SourceHandle<FileChunk>,
) -> std::io::Result<()> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    loop {
        if !handle.ready().await {
            debug!(path = %path.display(), offset, "file source abandoned");
            return Ok(());
        }

        let mut buf = vec![0u8; chunk_size];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            debug!(path = %path.display(), offset, "file source reached end");
            handle.end();
            return Ok(());
        }
        buf.truncate(n);

        trace!(path = %path.display(), offset, len = n, "file chunk");
        let chunk = FileChunk {
            offset,
            data: Bytes::from(buf),
        };
        if !handle.send(chunk) {
            return Ok(());
        }
        offset += n as u64;
    }
}

/// A regular file found under a `dir_source` root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the root, `/`-separated.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Spawns a walker emitting every regular file under `root`, directory by
/// directory in name order. A file root yields itself, named after its file
/// name. Symlinks are skipped.
pub fn dir_source(root: impl AsRef<Path>) -> PushSource<FileEntry> {
    let root: PathBuf = root.as_ref().to_path_buf();
    let (handle, source) = push_source();
    tokio::spawn(async move {
        if let Err(err) = list_files(&root, &handle).await {
            debug!(root = %root.display(), error = %err, "dir source failed");
            handle.fail(err);
        }
    });
    source
}

async fn list_files(root: &Path, handle: &SourceHandle<FileEntry>) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(root).await?;
    if meta.is_file() {
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if handle.ready().await
            && handle.send(FileEntry {
                name,
                path: root.to_path_buf(),
                size: meta.len(),
            })
        {
            handle.end();
        }
        return Ok(());
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut listing = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = listing.next_entry().await? {
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let meta = entry.metadata().await?;
            let path = entry.path();
            if meta.is_dir() {
                subdirs.push(path);
                continue;
            }
            if !meta.is_file() {
                continue;
            }

            if !handle.ready().await {
                debug!(root = %root.display(), "dir source abandoned");
                return Ok(());
            }
            let name = relative_name(root, &path);
            trace!(%name, size = meta.len(), "file listed");
            let listed = FileEntry {
                name,
                path,
                size: meta.len(),
            };
            if !handle.send(listed) {
                return Ok(());
            }
        }
        // Popped from the back, so push in reverse to visit in name order.
        pending.extend(subdirs.into_iter().rev());
    }

    debug!(root = %root.display(), "dir source reached end");
    handle.end();
    Ok(())
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
