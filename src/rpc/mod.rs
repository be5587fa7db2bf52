//! Application protocol carried by the transport.
//!
//! Requests are a closed set; the server dispatches them with one exhaustive
//! match instead of looking methods up by name.

mod client;
mod store;
mod upload;

pub use client::{RpcClient, RpcClientError};
pub use store::ChunkStore;
pub use upload::{push_tree, PushReport, PushSettings};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::PipeError;
use crate::core::flow::{tunnel, Popper, Pusher};
use crate::transport::{IncomingRequest, OutgoingReply};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Announces a file; answered with `Stored`, how much of it the server
    /// already holds.
    Offer { name: String, size: u64 },
    /// Bytes of file `name` starting at `offset`.
    StoreChunk {
        name: String,
        offset: u64,
        data: Vec<u8>,
    },
    /// `id` is chosen by the caller to find its pending call again.
    Call { id: u64, call: RpcCall },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCall {
    Ping,
    Double(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    /// Current length of the offered file, 0 if absent.
    Stored { length: u64 },
    /// Length of the file after the write.
    Written { length: u64 },
    Value(i64),
    Pong,
    Failed(String),
}

/// Server-side implementation of every request kind.
pub trait RpcService: Send + Sync {
    fn stored_length<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<u64>>;

    fn store_chunk<'a>(
        &'a self,
        name: &'a str,
        offset: u64,
        data: Vec<u8>,
    ) -> BoxFuture<'a, anyhow::Result<u64>>;

    fn double(&self, value: i64) -> i64 {
        value.saturating_mul(2)
    }
}

/// Runs one request against `service`. Service failures become
/// `RpcReply::Failed` so the peer always gets an answer.
pub async fn dispatch<S: RpcService + ?Sized>(service: &S, request: RpcRequest) -> RpcReply {
    match request {
        RpcRequest::Offer { name, size } => match service.stored_length(&name).await {
            Ok(length) => RpcReply::Stored { length },
            Err(err) => {
                warn!(%name, size, error = %err, "offer failed");
                RpcReply::Failed(err.to_string())
            }
        },
        RpcRequest::StoreChunk { name, offset, data } => {
            match service.store_chunk(&name, offset, data).await {
                Ok(length) => RpcReply::Written { length },
                Err(err) => {
                    warn!(%name, offset, error = %err, "store_chunk failed");
                    RpcReply::Failed(err.to_string())
                }
            }
        }
        RpcRequest::Call { call, .. } => match call {
            RpcCall::Ping => RpcReply::Pong,
            RpcCall::Double(value) => RpcReply::Value(service.double(value)),
        },
    }
}

/// Answers every request from `requests` exactly once on `replies`, in
/// arrival order, then finishes `replies`. Returns how many were answered.
pub async fn serve_requests<S, P, W>(requests: &P, replies: &W, service: &S) -> Result<usize, PipeError>
where
    S: RpcService + ?Sized,
    P: Popper<IncomingRequest<RpcRequest>> + ?Sized,
    W: Pusher<OutgoingReply<RpcReply>> + ?Sized,
{
    tunnel(requests, replies, |incoming: IncomingRequest<RpcRequest>| async move {
        let reply = dispatch(service, incoming.request).await;
        Ok(OutgoingReply {
            id: incoming.id,
            reply,
        })
    })
    .await
}
