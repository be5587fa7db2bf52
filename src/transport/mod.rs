//! Request/reply multiplexer over a single duplex connection.
//!
//! Outgoing requests are tagged with a fresh `MessageId` and parked in an
//! in-flight table until the matching reply comes back, in whatever order the
//! peer answers. Requests from the peer are handed to the application through
//! `rx_out`, and its answers taken back from `rx_in`.
//!
//! Three loops run once started:
//! - receive: decodes inbound messages and routes them by kind,
//! - reply-send: encodes and sends the application's replies,
//! - request-send: encodes and sends requests, bounded by the in-flight
//!   table's watermarks.
//!
//! When `tx_in` reports end-of-data the transport stops taking requests and
//! drains; `tx_out` is finished exactly once, after the last reply.

pub mod codec;
pub mod connection;
mod error;
pub mod id;

pub use codec::{BinaryCodec, CodecError, Envelope, EnvelopeCodec, MessageKind};
pub use connection::{
    memory_pair, ConnectionError, DuplexConnection, FramedConnection, FramedReader, Inbound,
    MemoryConnection, MemoryLink, MemoryReceiver,
};
pub use error::TransportError;
pub use id::{MessageId, MessageIdGenerator};

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::core::flow::{
    direct_pusher, suspend_until_available, suspend_until_room, wait_popper, Popper, Pusher,
    Watermarks,
};
use crate::core::queue::Queue;

/// A request of ours paired with the peer's reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlated<Req, Rep> {
    pub request: Req,
    pub reply: Rep,
}

/// A request from the peer, awaiting an `OutgoingReply` with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest<Req> {
    pub id: MessageId,
    pub request: Req,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingReply<Rep> {
    pub id: MessageId,
    pub reply: Rep,
}

/// Entry of the in-flight table.
#[derive(Debug, Clone)]
pub struct InFlight<Req> {
    pub message_id: MessageId,
    pub request: Req,
}

/// The four application-facing channels.
pub struct TransportChannels<Req, Rep> {
    /// Requests to send. End-of-data starts the drain.
    pub tx_in: Arc<dyn Popper<Req>>,
    /// Requests paired with their replies; finished once drained.
    pub tx_out: Arc<dyn Pusher<Correlated<Req, Rep>>>,
    /// Requests from the peer; finished when the connection's inbound closes.
    pub rx_out: Arc<dyn Pusher<IncomingRequest<Req>>>,
    /// Replies to the peer's requests.
    pub rx_in: Arc<dyn Popper<OutgoingReply<Rep>>>,
}

impl<Req: Send + 'static, Rep: Send + 'static> TransportChannels<Req, Rep> {
    /// Blocking readers on `tx_in` / `rx_in`, direct writers on `tx_out` /
    /// `rx_out`.
    pub fn from_queues(
        tx_in: &Queue<Req>,
        tx_out: &Queue<Correlated<Req, Rep>>,
        rx_out: &Queue<IncomingRequest<Req>>,
        rx_in: &Queue<OutgoingReply<Rep>>,
    ) -> Self {
        Self {
            tx_in: Arc::new(wait_popper(tx_in)),
            tx_out: Arc::new(direct_pusher(tx_out)),
            rx_out: Arc::new(direct_pusher(rx_out)),
            rx_in: Arc::new(wait_popper(rx_in)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    /// Accepting new outgoing requests.
    Active,
    /// No new requests; waiting for the in-flight table to empty.
    Draining,
    /// Drained; `tx_out` has been finished.
    Complete,
}

#[derive(Debug)]
struct DrainState {
    phase: TransportPhase,
    /// Replies taken off the in-flight table but not yet pushed to `tx_out`.
    delivering: usize,
}

#[derive(Debug)]
struct Drain {
    state: Mutex<DrainState>,
}

impl Drain {
    fn new() -> Self {
        Self {
            state: Mutex::new(DrainState {
                phase: TransportPhase::Active,
                delivering: 0,
            }),
        }
    }

    fn phase(&self) -> TransportPhase {
        self.state.lock().phase
    }

    fn begin(&self) {
        let mut state = self.state.lock();
        if state.phase == TransportPhase::Active {
            state.phase = TransportPhase::Draining;
        }
    }

    /// Must be called before a reply is looked up in the in-flight table and
    /// paired with `delivered` once its `tx_out` push has returned.
    fn delivering(&self) {
        self.state.lock().delivering += 1;
    }

    fn delivered(&self) {
        let mut state = self.state.lock();
        state.delivering = state.delivering.saturating_sub(1);
    }

    /// Moves to `Complete` if draining with nothing in flight or being
    /// delivered. Only the first caller to observe that gets `true`.
    fn try_complete<Req: Send + 'static>(&self, in_flight: &Queue<InFlight<Req>>) -> bool {
        let mut state = self.state.lock();
        if state.phase == TransportPhase::Draining && state.delivering == 0 && in_flight.empty() {
            state.phase = TransportPhase::Complete;
            return true;
        }
        false
    }
}

pub struct Transport<Req, Rep> {
    channels: TransportChannels<Req, Rep>,
    connection: Arc<dyn DuplexConnection>,
    codec: Arc<dyn EnvelopeCodec<Req, Rep>>,
    in_flight: Queue<InFlight<Req>>,
    received: Queue<Bytes>,
    marks: Watermarks,
    ids: MessageIdGenerator,
    drain: Arc<Drain>,
}

impl<Req, Rep> Transport<Req, Rep>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Rep: Serialize + DeserializeOwned + Send + 'static,
{
    /// Transport using the `BinaryCodec` envelope.
    pub fn new(
        channels: TransportChannels<Req, Rep>,
        connection: Arc<dyn DuplexConnection>,
        marks: Watermarks,
    ) -> Self {
        Self::with_codec(channels, connection, Arc::new(BinaryCodec::new()), marks)
    }
}

impl<Req, Rep> Transport<Req, Rep>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    pub fn with_codec(
        channels: TransportChannels<Req, Rep>,
        connection: Arc<dyn DuplexConnection>,
        codec: Arc<dyn EnvelopeCodec<Req, Rep>>,
        marks: Watermarks,
    ) -> Self {
        Self {
            channels,
            connection,
            codec,
            in_flight: Queue::new("network"),
            received: Queue::new("rcv"),
            marks,
            ids: MessageIdGenerator::new(),
            drain: Arc::new(Drain::new()),
        }
    }

    /// Replaces the random id prefix.
    pub fn with_id_generator(mut self, ids: MessageIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Where the connection's received messages go.
    pub fn inbound(&self) -> Inbound {
        Inbound::new(self.received.clone())
    }

    /// The in-flight table, for introspection.
    pub fn in_flight(&self) -> &Queue<InFlight<Req>> {
        &self.in_flight
    }

    /// The raw receive queue, for introspection.
    pub fn received(&self) -> &Queue<Bytes> {
        &self.received
    }

    /// Spawns the three loops.
    pub fn start(self) -> TransportHandle {
        let Self {
            channels,
            connection,
            codec,
            in_flight,
            received,
            marks,
            ids,
            drain,
        } = self;

        debug!(id_prefix = %ids.prefix(), "transport starting");

        let receive = tokio::spawn(report(
            "receive",
            receive_loop(
                received,
                in_flight.clone(),
                Arc::clone(&codec),
                Arc::clone(&channels.tx_out),
                channels.rx_out,
                Arc::clone(&drain),
            ),
        ));

        let replies = tokio::spawn(report(
            "reply-send",
            reply_send_loop(channels.rx_in, Arc::clone(&codec), Arc::clone(&connection)),
        ));

        let requests = tokio::spawn(report(
            "request-send",
            request_send_loop(RequestSend {
                tx_in: channels.tx_in,
                tx_out: channels.tx_out,
                in_flight,
                codec,
                connection,
                marks,
                ids,
                drain: Arc::clone(&drain),
            }),
        ));

        TransportHandle {
            receive,
            replies,
            requests,
            drain,
        }
    }
}

/// Running transport.
pub struct TransportHandle {
    receive: JoinHandle<Result<(), TransportError>>,
    replies: JoinHandle<Result<(), TransportError>>,
    requests: JoinHandle<Result<(), TransportError>>,
    drain: Arc<Drain>,
}

impl TransportHandle {
    pub fn phase(&self) -> TransportPhase {
        self.drain.phase()
    }

    /// Stops all loops. Pending requests are dropped.
    pub fn abort(&self) {
        self.receive.abort();
        self.replies.abort();
        self.requests.abort();
    }

    /// Waits for all three loops and returns the first failure.
    pub async fn join(self) -> Result<(), TransportError> {
        let mut first_err = None;
        for handle in [self.receive, self.replies, self.requests] {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(err) => Err(TransportError::Aborted(err.to_string())),
            };
            if let Err(err) = outcome {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

async fn report<F>(name: &'static str, run: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    let result = run.await;
    match &result {
        Ok(()) => debug!(transport_loop = name, "loop finished"),
        Err(err) => error!(transport_loop = name, error = %err, "loop failed"),
    }
    result
}

async fn receive_loop<Req, Rep>(
    received: Queue<Bytes>,
    in_flight: Queue<InFlight<Req>>,
    codec: Arc<dyn EnvelopeCodec<Req, Rep>>,
    tx_out: Arc<dyn Pusher<Correlated<Req, Rep>>>,
    rx_out: Arc<dyn Pusher<IncomingRequest<Req>>>,
    drain: Arc<Drain>,
) -> Result<(), TransportError>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    let result = route_received(&received, &in_flight, &*codec, &*tx_out, &*rx_out, &drain).await;
    // The peer can no longer send requests.
    rx_out.finish();
    result
}

async fn route_received<Req, Rep>(
    received: &Queue<Bytes>,
    in_flight: &Queue<InFlight<Req>>,
    codec: &dyn EnvelopeCodec<Req, Rep>,
    tx_out: &dyn Pusher<Correlated<Req, Rep>>,
    rx_out: &dyn Pusher<IncomingRequest<Req>>,
    drain: &Drain,
) -> Result<(), TransportError>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    while let Some(message) = suspend_until_available(received).await {
        match codec.decode(&message)? {
            Envelope::Request { id, payload } => {
                trace!(message_id = %id, "request received");
                rx_out.push(IncomingRequest { id, request: payload }).await;
            }
            Envelope::Reply { id, payload } => {
                drain.delivering();
                let Some(entry) = in_flight.pop_filter(|entry| entry.message_id == id).await else {
                    drain.delivered();
                    return Err(TransportError::UnknownCorrelation(id));
                };
                trace!(message_id = %id, "reply correlated");
                tx_out
                    .push(Correlated {
                        request: entry.request,
                        reply: payload,
                    })
                    .await;
                drain.delivered();

                if drain.try_complete(in_flight) {
                    debug!("last reply received, transport drained");
                    tx_out.finish();
                }
            }
        }
    }
    Ok(())
}

async fn reply_send_loop<Req, Rep>(
    rx_in: Arc<dyn Popper<OutgoingReply<Rep>>>,
    codec: Arc<dyn EnvelopeCodec<Req, Rep>>,
    connection: Arc<dyn DuplexConnection>,
) -> Result<(), TransportError>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    while let Some(OutgoingReply { id, reply }) = rx_in.pop().await {
        let message = codec.encode_reply(&id, &reply)?;
        if let Err(err) = connection.send(message).await {
            warn!(message_id = %id, error = %err, "reply not sent");
        }
    }
    Ok(())
}

struct RequestSend<Req, Rep> {
    tx_in: Arc<dyn Popper<Req>>,
    tx_out: Arc<dyn Pusher<Correlated<Req, Rep>>>,
    in_flight: Queue<InFlight<Req>>,
    codec: Arc<dyn EnvelopeCodec<Req, Rep>>,
    connection: Arc<dyn DuplexConnection>,
    marks: Watermarks,
    ids: MessageIdGenerator,
    drain: Arc<Drain>,
}

async fn request_send_loop<Req, Rep>(state: RequestSend<Req, Rep>) -> Result<(), TransportError>
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    while let Some(request) = state.tx_in.pop().await {
        let message_id = state.ids.next_id();
        let message = state.codec.encode_request(&message_id, &request)?;

        suspend_until_room(
            &state.in_flight,
            InFlight {
                message_id: message_id.clone(),
                request,
            },
            &state.marks,
        )
        .await;

        trace!(message_id = %message_id, in_flight = state.in_flight.size(), "request sent");
        if let Err(err) = state.connection.send(message).await {
            warn!(message_id = %message_id, error = %err, "request not sent");
        }
    }

    state.drain.begin();
    debug!(in_flight = state.in_flight.size(), "no more requests, draining");
    if state.drain.try_complete(&state.in_flight) {
        debug!("nothing in flight, transport drained");
        state.tx_out.finish();
    }
    Ok(())
}
