//! Transport layer abstraction for sync exchanges.
//!
//! A [`Transport`] takes an encoded request frame and hands back a
//! [`PendingReply`]. The reply is a one-shot channel, so the answer can come
//! from any thread or async task while `sync()` waits with a timeout.

use crate::error::{SyncError, SyncResult};
use crate::server::MemoryServer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use syncdb_protocol::{Request, Response};
use thiserror::Error;

/// A failure reported by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// Error message.
    pub message: String,
    /// Whether the exchange can be retried.
    pub retryable: bool,
}

impl TransportError {
    /// Creates a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        SyncError::Transport {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// What a transport eventually produces for one request.
pub type ReplyResult = Result<Vec<u8>, TransportError>;

/// Carries request frames to the sync server.
pub trait Transport: Send + Sync {
    /// Sends `frame` and returns a handle to the eventual response frame.
    fn send(&self, frame: Vec<u8>) -> PendingReply;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, frame: Vec<u8>) -> PendingReply {
        (**self).send(frame)
    }
}

/// The receiving half of a reply.
#[derive(Debug)]
pub struct PendingReply {
    rx: Receiver<ReplyResult>,
}

impl PendingReply {
    /// Creates a connected sender/reply pair.
    pub fn channel() -> (ReplySender, PendingReply) {
        let (tx, rx) = mpsc::channel();
        (ReplySender { tx }, PendingReply { rx })
    }

    /// Creates a reply that is already answered.
    pub fn ready(result: ReplyResult) -> Self {
        let (sender, reply) = Self::channel();
        sender.send(result);
        reply
    }

    /// Waits up to `timeout` for the response frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if nothing arrives in time, or a
    /// transport error if the transport failed or dropped the reply.
    pub fn wait(self, timeout: Duration) -> SyncResult<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(SyncError::from),
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::transport_retryable(
                "transport dropped the reply without answering",
            )),
        }
    }
}

/// The sending half of a reply.
#[derive(Debug)]
pub struct ReplySender {
    tx: Sender<ReplyResult>,
}

impl ReplySender {
    /// Delivers the outcome. Returns false if nobody is waiting any more.
    pub fn send(self, result: ReplyResult) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Delivers a response frame.
    pub fn respond(self, frame: Vec<u8>) -> bool {
        self.send(Ok(frame))
    }

    /// Delivers a transport failure.
    pub fn fail(self, err: TransportError) -> bool {
        self.send(Err(err))
    }
}

/// A request frame waiting to be served by a [`ChannelTransport`] peer.
#[derive(Debug)]
pub struct Exchange {
    /// Encoded request.
    pub frame: Vec<u8>,
    /// Where the answer goes.
    pub reply: ReplySender,
}

/// A transport that hands every request to a serving thread or task.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Sender<Exchange>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver its peer serves from.
    pub fn new() -> (Self, Receiver<Exchange>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Serves requests from `server` on a background thread.
    ///
    /// The thread exits once the transport is dropped.
    pub fn serve(server: Arc<MemoryServer>) -> (Self, JoinHandle<()>) {
        let (transport, rx) = Self::new();
        let handle = std::thread::spawn(move || {
            for exchange in rx {
                exchange.reply.send(server.handle(&exchange.frame));
            }
        });
        (transport, handle)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Vec<u8>) -> PendingReply {
        let (reply, pending) = PendingReply::channel();
        if let Err(mpsc::SendError(exchange)) = self.tx.send(Exchange { frame, reply }) {
            exchange
                .reply
                .fail(TransportError::retryable("transport peer is gone"));
        }
        pending
    }
}

/// A scripted answer for [`MockTransport`].
pub enum MockReply {
    /// Answer with this frame.
    Respond(Vec<u8>),
    /// Answer with a response computed from the decoded request.
    Answer(Box<dyn FnOnce(Request) -> Response + Send>),
    /// Fail the exchange.
    Fail(TransportError),
    /// Never answer.
    Silent,
}

impl MockReply {
    /// Answers with `response`.
    pub fn response(response: &Response) -> Self {
        Self::Respond(response.encode())
    }

    /// Answers with a response built from the request.
    pub fn answer(f: impl FnOnce(Request) -> Response + Send + 'static) -> Self {
        Self::Answer(Box::new(f))
    }
}

impl std::fmt::Debug for MockReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Respond(frame) => f.debug_tuple("Respond").field(&frame.len()).finish(),
            Self::Answer(_) => f.write_str("Answer"),
            Self::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
            Self::Silent => f.write_str("Silent"),
        }
    }
}

/// A mock transport for testing.
///
/// Replies are consumed in the order they were queued. Every sent frame is
/// recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    sent: Mutex<Vec<Vec<u8>>>,
    held: Mutex<Vec<ReplySender>>,
}

impl MockTransport {
    /// Creates a new mock transport with no queued replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Returns every frame sent so far.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Returns every decodable request sent so far.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| Request::decode(frame).ok())
            .collect()
    }

    /// Returns the most recent request.
    pub fn last_request(&self) -> Option<Request> {
        self.sent_requests().pop()
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: Vec<u8>) -> PendingReply {
        self.sent.lock().push(frame.clone());
        let next = self.replies.lock().pop_front();
        match next {
            Some(MockReply::Respond(reply)) => PendingReply::ready(Ok(reply)),
            Some(MockReply::Answer(f)) => match Request::decode(&frame) {
                Ok(request) => PendingReply::ready(Ok(f(request).encode())),
                Err(e) => PendingReply::ready(Err(TransportError::fatal(e.to_string()))),
            },
            Some(MockReply::Fail(err)) => PendingReply::ready(Err(err)),
            Some(MockReply::Silent) => {
                let (sender, reply) = PendingReply::channel();
                self.held.lock().push(sender);
                reply
            }
            None => PendingReply::ready(Err(TransportError::fatal("no scripted reply"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncdb_protocol::{ResponseStatus, SessionToken};

    fn request() -> Request {
        Request {
            token: SessionToken(5),
            cursor: 0,
            entries: vec![],
        }
    }

    #[test]
    fn ready_reply() {
        let reply = PendingReply::ready(Ok(vec![1, 2]));
        assert_eq!(reply.wait(Duration::ZERO).unwrap(), vec![1, 2]);
    }

    #[test]
    fn silent_reply_times_out() {
        let transport = MockTransport::new();
        transport.push_reply(MockReply::Silent);
        let reply = transport.send(request().encode());
        assert!(matches!(
            reply.wait(Duration::from_millis(10)),
            Err(SyncError::Timeout)
        ));
    }

    #[test]
    fn dropped_sender_is_transport_error() {
        let (sender, reply) = PendingReply::channel();
        drop(sender);
        let err = reply.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: true, .. }));
    }

    #[test]
    fn reply_from_another_thread() {
        let (sender, reply) = PendingReply::channel();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            sender.respond(vec![7])
        });
        assert_eq!(reply.wait(Duration::from_secs(5)).unwrap(), vec![7]);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn mock_records_and_answers() {
        let transport = MockTransport::new();
        transport.push_reply(MockReply::answer(|req| Response {
            token: req.token,
            status: ResponseStatus::Accepted,
            cursor: 9,
            entries: vec![],
        }));
        transport.push_reply(MockReply::Fail(TransportError::retryable("offline")));

        let frame = transport.send(request().encode()).wait(Duration::ZERO).unwrap();
        let response = Response::decode(&frame).unwrap();
        assert_eq!(response.token, SessionToken(5));
        assert_eq!(response.cursor, 9);

        let err = transport.send(request().encode()).wait(Duration::ZERO).unwrap_err();
        assert!(err.is_retryable());

        // Nothing left to answer with
        assert!(transport.send(vec![]).wait(Duration::ZERO).is_err());
        assert_eq!(transport.sent_frames().len(), 3);
        assert_eq!(transport.sent_requests().len(), 2);
        assert_eq!(transport.last_request(), Some(request()));
    }

    #[test]
    fn channel_transport_without_peer() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let err = transport.send(vec![1]).wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
    }
}
