use super::CallHandle;
use crate::dispatcher::DispatchContext;
use crate::error::Error;
use crate::message::Message;
use crate::pipeline::{OutboundEvent, StageContext, StageId, Task};
use crate::promise::StatusPromise;
use crate::status::Status;

use tracing::{debug, trace};

/// Status-sending half shared by every call shape.
///
/// Owns the call's [`StatusPromise`] and turns its settlement into the one
/// trailer the call writes.
pub struct CallCore<Resp> {
    id: StageId,
    promise: StatusPromise,
    handle: CallHandle<Resp>,
}

impl<Resp> CallCore<Resp> {
    pub fn stage_id(&self) -> StageId {
        self.id
    }
}

impl<Resp: Message> CallCore<Resp> {
    pub(crate) fn new(ctx: &DispatchContext, max_responses: Option<usize>) -> Self {
        let id = StageId::next();
        let promise = StatusPromise::new();
        let handle = CallHandle::new(
            id,
            ctx.mailbox().clone(),
            promise.clone(),
            ctx.shared_head(),
            max_responses,
        );
        Self {
            id,
            promise,
            handle,
        }
    }

    pub fn handle(&self) -> &CallHandle<Resp> {
        &self.handle
    }

    pub fn is_settled(&self) -> bool {
        self.promise.is_settled()
    }

    /// Hook the promise up to the stream's loop. Settlement from any thread
    /// is delivered back to this stage as `status_settled`.
    pub(crate) fn install(&self, ctx: &mut StageContext<'_>) {
        let mailbox = ctx.mailbox().clone();
        let stage = self.id;
        self.promise
            .when_complete(move |result| mailbox.post(Task::Settled { stage, result }));
    }

    pub(crate) fn fail(&self, error: Error) -> bool {
        self.promise.fail(error)
    }

    /// Write the trailer for a settled call.
    pub(crate) fn send_trailers(&self, ctx: &mut StageContext<'_>, result: Result<Status, Error>) {
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                debug!(stream_id = %ctx.stream_id(), error = %e, "call failed");
                e.into_status()
            }
        };
        trace!(stream_id = %ctx.stream_id(), code = %status.code(), "sending status");
        ctx.write(OutboundEvent::Trailers(status.to_trailers()), None);
    }
}
