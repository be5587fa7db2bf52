//! Wire envelope: `[u8 kind][u16 id_len][id utf8][payload]`.
//!
//! The header is fixed binary; the payload is JSON so that any serde type can
//! ride in it.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::transport::id::MessageId;

pub const HEADER_FIXED_LEN: usize = 1 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Reply = 1,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Reply),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope<Req, Rep> {
    Request { id: MessageId, payload: Req },
    Reply { id: MessageId, payload: Rep },
}

impl<Req, Rep> Envelope<Req, Rep> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Request { .. } => MessageKind::Request,
            Envelope::Reply { .. } => MessageKind::Reply,
        }
    }

    pub fn id(&self) -> &MessageId {
        match self {
            Envelope::Request { id, .. } | Envelope::Reply { id, .. } => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message truncated: {0} bytes")]
    Truncated(usize),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("message id too long: {0} bytes")]
    IdTooLong(usize),

    #[error("message id is not valid UTF-8")]
    InvalidId,

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Serializer collaborator used by the transport.
pub trait EnvelopeCodec<Req, Rep>: Send + Sync {
    fn encode_request(&self, id: &MessageId, payload: &Req) -> Result<Bytes, CodecError>;
    fn encode_reply(&self, id: &MessageId, payload: &Rep) -> Result<Bytes, CodecError>;
    fn decode(&self, message: &[u8]) -> Result<Envelope<Req, Rep>, CodecError>;
}

/// Binary header + JSON payload.
#[derive(Debug)]
pub struct BinaryCodec<Req, Rep> {
    _marker: PhantomData<fn() -> (Req, Rep)>,
}

impl<Req, Rep> Default for BinaryCodec<Req, Rep> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<Req, Rep> BinaryCodec<Req, Rep> {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode_envelope<P: Serialize>(
    kind: MessageKind,
    id: &MessageId,
    payload: &P,
) -> Result<Bytes, CodecError> {
    let id_bytes = id.as_bytes();
    let id_len = u16::try_from(id_bytes.len()).map_err(|_| CodecError::IdTooLong(id_bytes.len()))?;
    let body = serde_json::to_vec(payload)?;

    let mut buf = BytesMut::with_capacity(HEADER_FIXED_LEN + id_bytes.len() + body.len());
    buf.put_u8(kind.into());
    buf.put_u16(id_len);
    buf.put_slice(id_bytes);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

impl<Req, Rep> EnvelopeCodec<Req, Rep> for BinaryCodec<Req, Rep>
where
    Req: Serialize + DeserializeOwned,
    Rep: Serialize + DeserializeOwned,
{
    fn encode_request(&self, id: &MessageId, payload: &Req) -> Result<Bytes, CodecError> {
        encode_envelope(MessageKind::Request, id, payload)
    }

    fn encode_reply(&self, id: &MessageId, payload: &Rep) -> Result<Bytes, CodecError> {
        encode_envelope(MessageKind::Reply, id, payload)
    }

    fn decode(&self, message: &[u8]) -> Result<Envelope<Req, Rep>, CodecError> {
        if message.len() < HEADER_FIXED_LEN {
            return Err(CodecError::Truncated(message.len()));
        }

        let mut slice = message;
        let kind = MessageKind::try_from(slice.get_u8())?;
        let id_len = slice.get_u16() as usize;
        if slice.remaining() < id_len {
            return Err(CodecError::Truncated(message.len()));
        }

        let id = std::str::from_utf8(&slice[..id_len]).map_err(|_| CodecError::InvalidId)?;
        let id = MessageId::from(id);
        slice.advance(id_len);

        Ok(match kind {
            MessageKind::Request => Envelope::Request {
                id,
                payload: serde_json::from_slice(slice)?,
            },
            MessageKind::Reply => Envelope::Reply {
                id,
                payload: serde_json::from_slice(slice)?,
            },
        })
    }
}
