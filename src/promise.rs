//! One-shot resolution point for a call's status.

use crate::error::Error;
use crate::status::Status;
use parking_lot::Mutex;
use std::sync::Arc;

/// Continuation run once the promise settles.
type Callback = Box<dyn FnOnce(Result<Status, Error>) + Send>;

enum State {
    Pending(Vec<Callback>),
    Settled(Result<Status, Error>),
}

/// Single-assignment cell for a call's terminal status.
///
/// The first `succeed` or `fail` wins. Later attempts return `false` and do
/// nothing, which is what keeps a call to one trailer. Continuations run
/// exactly once, on the thread that settles the promise, so anything that
/// must happen on the stream's loop has to post itself there (see
/// [`Mailbox`](crate::Mailbox)).
#[derive(Clone)]
pub struct StatusPromise {
    state: Arc<Mutex<State>>,
}

impl StatusPromise {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Settle with a status. Returns `false` if already settled.
    pub fn succeed(&self, status: Status) -> bool {
        self.complete(Ok(status))
    }

    /// Settle with a failure. Returns `false` if already settled.
    pub fn fail(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock(), State::Settled(_))
    }

    /// The settled outcome, if any.
    pub fn result(&self) -> Option<Result<Status, Error>> {
        match &*self.state.lock() {
            State::Settled(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Register a continuation. Runs immediately if already settled.
    pub fn when_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<Status, Error>) + Send + 'static,
    {
        let result = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(f));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        f(result);
    }

    fn complete(&self, result: Result<Status, Error>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Settled(result.clone());
                    callbacks
                }
            }
        };

        // run outside the lock, callbacks may inspect the promise
        for callback in callbacks {
            callback(result.clone());
        }
        true
    }
}

impl Default for StatusPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Pending(callbacks) => format!("Pending({} callbacks)", callbacks.len()),
            State::Settled(Ok(status)) => format!("Settled({})", status),
            State::Settled(Err(error)) => format!("Failed({})", error),
        };
        f.debug_struct("StatusPromise").field("state", &state).finish()
    }
}
