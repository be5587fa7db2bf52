use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::queue::Queue;
use crate::rpc::{RpcCall, RpcReply, RpcRequest};
use crate::transport::Correlated;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcClientError {
    #[error("rpc client closed before the call was answered")]
    Closed,
    #[error("call failed on the server: {0}")]
    Remote(String),
    #[error("unexpected reply {0:?}")]
    Unexpected(RpcReply),
}

/// Typed calls over a transport.
///
/// Calls are queued on `calls()`, which the owner feeds into the transport's
/// `tx_in`. Whoever reads the transport's `tx_out` hands every pair to
/// `accept`, which completes the matching call.
#[derive(Debug)]
pub struct RpcClient {
    calls: Queue<RpcRequest>,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<RpcReply>>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self {
            calls: Queue::new("rpc-calls"),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &Queue<RpcRequest> {
        &self.calls
    }

    /// Calls not yet answered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sends `call` and waits for its reply. `Failed` replies come back as
    /// `RpcClientError::Remote`.
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply, RpcClientError> {
        if self.calls.is_finished() {
            return Err(RpcClientError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        self.calls.push(RpcRequest::Call { id, call }).await;

        match rx.await {
            Ok(RpcReply::Failed(reason)) => Err(RpcClientError::Remote(reason)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(RpcClientError::Closed),
        }
    }

    pub async fn ping(&self) -> Result<(), RpcClientError> {
        match self.call(RpcCall::Ping).await? {
            RpcReply::Pong => Ok(()),
            other => Err(RpcClientError::Unexpected(other)),
        }
    }

    pub async fn double(&self, value: i64) -> Result<i64, RpcClientError> {
        match self.call(RpcCall::Double(value)).await? {
            RpcReply::Value(doubled) => Ok(doubled),
            other => Err(RpcClientError::Unexpected(other)),
        }
    }

    /// Completes the call a pair answers. Pairs that are not calls are
    /// handed back.
    pub fn accept(
        &self,
        item: Correlated<RpcRequest, RpcReply>,
    ) -> Option<Correlated<RpcRequest, RpcReply>> {
        let Correlated { request, reply } = item;
        match request {
            RpcRequest::Call { id, .. } => {
                match self.pending.remove(&id) {
                    // The caller may have given up; its reply is dropped.
                    Some((_, caller)) => {
                        let _ = caller.send(reply);
                    }
                    None => warn!(call_id = id, "reply for unknown call"),
                }
                None
            }
            request => Some(Correlated { request, reply }),
        }
    }

    /// No further calls. Already queued ones are still sent.
    pub fn close(&self) {
        self.calls.finish();
    }

    /// Fails every pending call with `Closed`. For when no more replies can
    /// arrive.
    pub fn abandon(&self) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "abandoning unanswered calls");
        }
        self.pending.clear();
    }
}
