//! The call logic's view of a call.

use crate::error::Error;
use crate::message::{AnyMessage, Message};
use crate::metadata::Metadata;
use crate::pipeline::{Mailbox, OutboundEvent, RequestHead, StageId, StreamId, Task};
use crate::promise::StatusPromise;
use crate::status::Status;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Handle through which call logic sends responses and ends the call.
///
/// Handles are `Clone + Send` and may be moved to other threads. Nothing is
/// written inline: every operation is posted to the stream's mailbox and
/// runs, in order, when the owning loop next drains it. Responses sent
/// before the status therefore always reach the wire before the trailer.
pub struct CallHandle<Resp> {
    stage: StageId,
    mailbox: Mailbox,
    promise: StatusPromise,
    head: Arc<RequestHead>,
    responses: Arc<AtomicUsize>,
    max_responses: Option<usize>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp: Message> CallHandle<Resp> {
    pub(crate) fn new(
        stage: StageId,
        mailbox: Mailbox,
        promise: StatusPromise,
        head: Arc<RequestHead>,
        max_responses: Option<usize>,
    ) -> Self {
        Self {
            stage,
            mailbox,
            promise,
            head,
            responses: Arc::new(AtomicUsize::new(0)),
            max_responses,
            _marker: PhantomData,
        }
    }

    /// Queue a response message.
    ///
    /// Fails with [`Error::CallCompleted`] once the status is resolved and
    /// with [`Error::TooManyResponses`] when the call shape allows no more
    /// responses. Encoding failures surface only through
    /// [`send_message_with`](Self::send_message_with).
    pub fn send_message(&self, message: Resp) -> Result<(), Error> {
        self.enqueue(message, None)
    }

    /// Queue a response message and get told how the write went.
    pub fn send_message_with<F>(&self, message: Resp, on_complete: F) -> Result<(), Error>
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        self.enqueue(message, Some(Box::new(on_complete)))
    }

    /// Resolve the call. The first status wins; returns `false` if the call
    /// was already resolved.
    pub fn send_status(&self, status: Status) -> bool {
        self.promise.succeed(status)
    }

    /// Resolve the call with a failure. Anything but [`Error::Status`] is
    /// reported to the client as the generic processing error.
    pub fn fail(&self, error: impl Into<Error>) -> bool {
        self.promise.fail(error.into())
    }

    /// Send one response followed by an OK status.
    pub fn respond(&self, message: Resp) -> Result<(), Error> {
        self.send_message(message)?;
        self.send_status(Status::ok());
        Ok(())
    }

    /// Whether the call has been resolved.
    pub fn is_completed(&self) -> bool {
        self.promise.is_settled()
    }

    /// Number of responses accepted so far.
    pub fn responses_sent(&self) -> usize {
        self.responses.load(Ordering::Acquire)
    }

    pub fn stream_id(&self) -> StreamId {
        self.mailbox.stream_id()
    }

    /// The request path, `/{service}/{method}`.
    pub fn path(&self) -> &str {
        &self.head.path
    }

    /// The request headers.
    pub fn metadata(&self) -> &Metadata {
        &self.head.metadata
    }

    fn enqueue(
        &self,
        message: Resp,
        completion: Option<crate::pipeline::WriteCompletion>,
    ) -> Result<(), Error> {
        if self.promise.is_settled() {
            return Err(Error::CallCompleted);
        }

        let reserved = match self.max_responses {
            Some(max) => self
                .responses
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok(),
            None => {
                self.responses.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if !reserved {
            return Err(Error::TooManyResponses);
        }

        self.mailbox.post(Task::Write {
            from: self.stage,
            event: OutboundEvent::Message(AnyMessage::new(message)),
            completion,
        });
        Ok(())
    }
}

impl<Resp> Clone for CallHandle<Resp> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            mailbox: self.mailbox.clone(),
            promise: self.promise.clone(),
            head: self.head.clone(),
            responses: self.responses.clone(),
            max_responses: self.max_responses,
            _marker: PhantomData,
        }
    }
}

impl<Resp> std::fmt::Debug for CallHandle<Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("stream_id", &self.mailbox.stream_id())
            .field("path", &self.head.path)
            .field("promise", &self.promise)
            .finish()
    }
}
