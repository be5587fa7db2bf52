//! Pushes a file tree to a peer, resuming files it already partly holds.
//!
//! Stages, run together until the first one fails:
//! - list: walks the tree into `files`,
//! - offer: turns each file into an `Offer`, answered with the stored length,
//! - route: reads `tx_out`; call replies go to the client, short files are
//!   queued for sending from the remote length,
//! - send: streams each queued file as `StoreChunk` requests,
//! - merge: feeds calls, chunks and offers, in that priority, into `tx_in`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::core::error::{ConfigError, PipeError};
use crate::core::flow::{
    suspend_until_available, suspend_until_room, wait_pusher, Pusher, WaitPusher, Watermarks,
};
use crate::core::pipe::{
    dir_source, file_source, FanInPipe, FileChunk, FileEntry, QueueToQueuePipe, StreamToQueuePipe,
};
use crate::core::queue::Queue;
use crate::rpc::{RpcClient, RpcReply, RpcRequest};
use crate::transport::Correlated;

#[derive(Debug, Clone, Copy)]
pub struct PushSettings {
    /// Between a source and its first queue.
    pub source: Watermarks,
    /// Between two queues, and into `tx_in`.
    pub stage: Watermarks,
    pub chunk_size: usize,
}

impl PushSettings {
    pub fn from_config(pipeline: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            source: pipeline.source_watermarks()?,
            stage: pipeline.stage_watermarks()?,
            chunk_size: pipeline.chunk_size,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Files offered to the peer.
    pub offered: usize,
    /// Offered files the peer held less of than we have.
    pub transferred: usize,
    /// Chunks the peer acknowledged.
    pub chunks: usize,
    pub bytes: u64,
}

/// A file to send from `offset` on.
#[derive(Debug)]
struct Transfer {
    name: String,
    path: PathBuf,
    offset: u64,
}

#[derive(Debug, Default)]
struct TallyState {
    offered: usize,
    answered: usize,
    listing_done: bool,
}

/// Decides when no more transfers can appear: the listing is over and every
/// offer has its answer. Exactly one of the two calls reports that.
#[derive(Debug, Default)]
struct OfferTally(Mutex<TallyState>);

impl OfferTally {
    fn offered(&self) {
        self.0.lock().offered += 1;
    }

    fn answered(&self) -> bool {
        let mut state = self.0.lock();
        state.answered += 1;
        state.listing_done && state.answered == state.offered
    }

    fn listing_done(&self) -> bool {
        let mut state = self.0.lock();
        state.listing_done = true;
        state.answered == state.offered
    }
}

/// Offers every file under `root` over a transport whose request side is
/// `tx_in` and whose answers arrive on `tx_out`, then sends whatever the peer
/// is missing.
///
/// `client`'s calls share the transport and go first. The push returns once
/// all files are handled, `client` is closed and the transport has drained.
/// On failure, pending calls of `client` fail with `Closed`.
pub async fn push_tree(
    root: impl AsRef<Path>,
    client: &RpcClient,
    tx_in: &Queue<RpcRequest>,
    tx_out: &Queue<Correlated<RpcRequest, RpcReply>>,
    settings: PushSettings,
) -> Result<PushReport, PipeError> {
    if settings.chunk_size == 0 {
        return Err(ConfigError::InvalidChunkSize(0).into());
    }
    let root = root.as_ref();
    info!(root = %root.display(), "pushing tree");

    let files = Queue::<FileEntry>::new("files");
    let offers = Queue::<RpcRequest>::new("offers");
    let to_send = Queue::<Transfer>::new("to-send");
    let chunks = Queue::<RpcRequest>::new("chunks");
    let paths: Arc<DashMap<String, PathBuf>> = Arc::new(DashMap::new());
    let tally = Arc::new(OfferTally::default());

    let list = StreamToQueuePipe::new(dir_source(root), files.clone(), settings.source).start();

    let offer = {
        let relay = {
            let paths = Arc::clone(&paths);
            let tally = Arc::clone(&tally);
            QueueToQueuePipe::with_transform(
                files,
                offers.clone(),
                settings.stage,
                move |entry: FileEntry| {
                    paths.insert(entry.name.clone(), entry.path);
                    tally.offered();
                    let offer = RpcRequest::Offer {
                        name: entry.name,
                        size: entry.size,
                    };
                    async move { Ok(offer) }
                },
            )
        };
        let tally = Arc::clone(&tally);
        let to_send = to_send.clone();
        async move {
            let offered = relay.start().await?;
            if tally.listing_done() {
                to_send.finish();
            }
            Ok::<_, PipeError>(offered)
        }
    };

    let route = route_replies(
        client,
        tx_out,
        wait_pusher(&to_send, settings.stage),
        &paths,
        &tally,
    );
    let send = send_files(&to_send, &chunks, settings);
    let merge = {
        let fan_in = FanInPipe::new(
            vec![client.calls().clone(), chunks.clone(), offers],
            wait_pusher(tx_in, settings.stage),
        );
        async move { Ok::<_, PipeError>(fan_in.start().await) }
    };

    match tokio::try_join!(list, offer, route, send, merge) {
        Ok((_, offered, routed, _, _)) => {
            let report = PushReport { offered, ..routed };
            info!(
                offered = report.offered,
                transferred = report.transferred,
                chunks = report.chunks,
                bytes = report.bytes,
                "tree pushed"
            );
            Ok(report)
        }
        Err(err) => {
            client.close();
            client.abandon();
            Err(err)
        }
    }
}

async fn route_replies(
    client: &RpcClient,
    tx_out: &Queue<Correlated<RpcRequest, RpcReply>>,
    to_send: WaitPusher<Transfer>,
    paths: &DashMap<String, PathBuf>,
    tally: &OfferTally,
) -> Result<PushReport, PipeError> {
    let mut routed = PushReport::default();

    while let Some(item) = suspend_until_available(tx_out).await {
        let Some(Correlated { request, reply }) = client.accept(item) else {
            continue;
        };
        match (request, reply) {
            (RpcRequest::Offer { name, size }, RpcReply::Stored { length }) => {
                let (name, path) = paths
                    .remove(&name)
                    .ok_or_else(|| PipeError::Consumer(anyhow!("answer for unlisted file {name}")))?;
                if length < size {
                    debug!(%name, remote = length, size, "file needs sending");
                    to_send
                        .push(Transfer {
                            name,
                            path,
                            offset: length,
                        })
                        .await;
                    routed.transferred += 1;
                } else {
                    debug!(%name, size, "file already stored");
                }
                if tally.answered() {
                    to_send.finish();
                }
            }
            (RpcRequest::StoreChunk { data, .. }, RpcReply::Written { .. }) => {
                routed.chunks += 1;
                routed.bytes += data.len() as u64;
            }
            (request, RpcReply::Failed(reason)) => {
                return Err(PipeError::Consumer(anyhow!(
                    "peer refused {}: {reason}",
                    describe(&request)
                )));
            }
            (request, reply) => {
                return Err(PipeError::Consumer(anyhow!(
                    "unexpected reply {reply:?} to {}",
                    describe(&request)
                )));
            }
        }
    }

    // tx_out is drained: nothing can answer the remaining calls.
    client.abandon();
    Ok(routed)
}

/// Streams each queued file into `chunks`, one file at a time, then finishes
/// `chunks`. Returns how many chunks were queued.
async fn send_files(
    to_send: &Queue<Transfer>,
    chunks: &Queue<RpcRequest>,
    settings: PushSettings,
) -> Result<usize, PipeError> {
    let mut queued = 0;
    while let Some(Transfer { name, path, offset }) = suspend_until_available(to_send).await {
        debug!(%name, offset, "sending file");
        let file_chunks = Queue::<FileChunk>::new(format!("file:{name}"));
        let source = file_source(&path, offset, settings.chunk_size)?;
        let reading = StreamToQueuePipe::new(source, file_chunks.clone(), settings.source).start();
        let forwarding = async {
            let mut forwarded = 0;
            while let Some(chunk) = suspend_until_available(&file_chunks).await {
                let request = RpcRequest::StoreChunk {
                    name: name.clone(),
                    offset: chunk.offset,
                    data: chunk.data.to_vec(),
                };
                suspend_until_room(chunks, request, &settings.stage).await;
                forwarded += 1;
            }
            Ok::<_, PipeError>(forwarded)
        };

        let (_, forwarded) = tokio::try_join!(reading, forwarding)?;
        queued += forwarded;
    }

    chunks.finish();
    Ok(queued)
}

fn describe(request: &RpcRequest) -> String {
    match request {
        RpcRequest::Offer { name, .. } => format!("offer of {name}"),
        RpcRequest::StoreChunk { name, offset, .. } => format!("chunk of {name} at {offset}"),
        RpcRequest::Call { id, call } => format!("call {id} ({call:?})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_reports_completion_once() {
        let tally = OfferTally::default();
        tally.offered();
        tally.offered();
        assert!(!tally.answered());
        assert!(!tally.listing_done());
        assert!(tally.answered());

        let empty = OfferTally::default();
        assert!(empty.listing_done());
    }
}
