//! Request/response correlation
//!
//! A client command is appended with a `(request stream id, request id)`
//! correlation. When the command is processed, the response staged by its
//! handler is routed back to the waiting request through a oneshot channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use super::{EngineError, Partition};
use crate::processor::Response;
use crate::record::{Intent, Key, Position, RecordDraft, RecordValue, RequestCorrelation};

/// Error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The partition dropped the request without responding
    #[error("response channel closed before a response was delivered")]
    ResponseDropped,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A command as submitted by a client
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub key: Option<Key>,
    pub intent: Intent,
    pub value: RecordValue,
}

impl CommandRequest {
    pub fn new(intent: impl Into<Intent>, value: impl Into<RecordValue>) -> Self {
        Self {
            key: None,
            intent: intent.into(),
            value: value.into(),
        }
    }

    /// Address an existing entity
    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub(crate) fn into_draft(self) -> RecordDraft {
        RecordDraft::command(self.key, self.intent, self.value)
    }
}

/// Routes responses to the requests waiting for them
#[derive(Default)]
pub struct ResponseRouter {
    pending: Mutex<HashMap<RequestCorrelation, oneshot::Sender<Response>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        correlation: RequestCorrelation,
    ) -> Result<oneshot::Receiver<Response>, EngineError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&correlation) {
            return Err(EngineError::DuplicateRequest(correlation));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(correlation, tx);
        Ok(rx)
    }

    pub(crate) fn unregister(&self, correlation: RequestCorrelation) {
        self.pending.lock().remove(&correlation);
    }

    /// Deliver a response; returns whether a request was waiting for it
    pub(crate) fn deliver(&self, response: Response) -> bool {
        let correlation = response.correlation();
        let Some(tx) = self.pending.lock().remove(&correlation) else {
            debug!(
                request_stream_id = correlation.request_stream_id,
                request_id = correlation.request_id,
                "No pending request for response, dropping it"
            );
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Number of requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A submitted command waiting for its response
#[derive(Debug)]
pub struct PendingResponse {
    position: Position,
    correlation: RequestCorrelation,
    receiver: oneshot::Receiver<Response>,
}

impl PendingResponse {
    pub(crate) fn new(
        position: Position,
        correlation: RequestCorrelation,
        receiver: oneshot::Receiver<Response>,
    ) -> Self {
        Self {
            position,
            correlation,
            receiver,
        }
    }

    /// Log position of the submitted command
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn correlation(&self) -> RequestCorrelation {
        self.correlation
    }

    /// Wait for the response
    pub async fn wait(self) -> Result<Response, GatewayError> {
        self.receiver.await.map_err(|_| GatewayError::ResponseDropped)
    }

    /// Take the response if it has arrived
    pub fn try_take(&mut self) -> Option<Result<Response, GatewayError>> {
        match self.receiver.try_recv() {
            Ok(response) => Some(Ok(response)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(GatewayError::ResponseDropped)),
        }
    }
}

/// Client entry point to a partition
///
/// Each gateway owns a request stream id and numbers its requests within it.
pub struct CommandGateway {
    partition: Arc<Partition>,
    request_stream_id: i32,
    next_request_id: AtomicU64,
}

impl CommandGateway {
    pub fn new(partition: Arc<Partition>, request_stream_id: i32) -> Self {
        Self {
            partition,
            request_stream_id,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn request_stream_id(&self) -> i32 {
        self.request_stream_id
    }

    /// Append a command and return a handle to its future response
    #[instrument(skip(self, request), fields(intent = %request.intent, stream = self.request_stream_id))]
    pub async fn send(&self, request: CommandRequest) -> Result<PendingResponse, GatewayError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let correlation = RequestCorrelation::new(self.request_stream_id, request_id);
        Ok(self.partition.submit(request, correlation).await?)
    }

    /// Send a command and wait for its response
    pub async fn send_and_wait(&self, request: CommandRequest) -> Result<Response, GatewayError> {
        self.send(request).await?.wait().await
    }
}

impl std::fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGateway")
            .field("request_stream_id", &self.request_stream_id)
            .finish_non_exhaustive()
    }
}
