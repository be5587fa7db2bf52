use thiserror::Error;

use crate::transport::codec::CodecError;
use crate::transport::id::MessageId;

#[derive(Debug, Error)]
pub enum TransportError {
    /// A reply named a request that is not in flight.
    #[error("reply for unknown request id {0}")]
    UnknownCorrelation(MessageId),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport loop aborted: {0}")]
    Aborted(String),
}
