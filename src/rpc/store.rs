use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};

use anyhow::bail;
use futures::future::{BoxFuture, FutureExt};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

use crate::rpc::RpcService;

/// Writes received chunks into files under one root directory, each at its
/// offset. File names are `/`-separated paths relative to the root.
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
    // Serializes writers so reported lengths are consistent.
    lock: Mutex<()>,
}

impl ChunkStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a peer-supplied name below the root. Anything that could escape
    /// it is refused.
    pub fn resolve(&self, name: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(name);
        let mut parts = 0;
        for part in relative.components() {
            match part {
                Component::Normal(_) => parts += 1,
                Component::CurDir => {}
                _ => bail!("refusing file name {name:?}"),
            }
        }
        if parts == 0 {
            bail!("empty file name");
        }
        Ok(self.root.join(relative))
    }

    /// Bytes held for `name`; 0 when nothing was stored yet.
    pub async fn length(&self, name: &str) -> anyhow::Result<u64> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_at(&self, name: &str, offset: u64, data: &[u8]) -> anyhow::Result<u64> {
        let path = self.resolve(name)?;
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let length = file.metadata().await?.len();
        trace!(%name, offset, len = data.len(), length, "chunk stored");
        Ok(length)
    }
}

impl RpcService for ChunkStore {
    fn stored_length<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<u64>> {
        self.length(name).boxed()
    }

    fn store_chunk<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        data: Vec<u8>,
    ) -> BoxFuture<'a, anyhow::Result<u64>> {
        async move { self.write_at(name, offset, &data).await }.boxed()
    }
}
