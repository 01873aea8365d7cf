use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::transport::TransportError;

/// Receives the raw reply frame for one request.
pub type Continuation = oneshot::Sender<Result<Vec<u8>, TransportError>>;

/// Requests waiting for a reply, queued per reply code.
///
/// Replies for a code go to its waiters first come, first served; codes do
/// not affect each other. A reply nobody is waiting for is dropped.
#[derive(Debug, Default)]
pub struct PendingResponses {
    queues: HashMap<u8, VecDeque<Continuation>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_for_response(&mut self, code: u8, continuation: Continuation) {
        self.queues.entry(code).or_default().push_back(continuation);
    }

    /// Hand `message` to the oldest live waiter for its code.
    /// Returns false when it was dropped instead.
    pub fn dispatch(&mut self, message: Vec<u8>) -> bool {
        let Some(&code) = message.get(1) else {
            warn!("dropping frame without a code: {message:x?}");
            return false;
        };
        debug!("dispatching 0x{code:x} reply ({} bytes)", message.len());
        self.deliver(code, Ok(message))
    }

    /// Fail the oldest live waiter for `code` with `error`.
    /// Returns false when nobody was waiting.
    pub fn reject(&mut self, code: u8, error: TransportError) -> bool {
        debug!("failing 0x{code:x} waiter: {error}");
        self.deliver(code, Err(error))
    }

    fn deliver(&mut self, code: u8, result: Result<Vec<u8>, TransportError>) -> bool {
        let Some(queue) = self.queues.get_mut(&code) else {
            warn!("nobody waiting for 0x{code:x}; dropping {result:x?}");
            return false;
        };
        while let Some(continuation) = queue.pop_front() {
            // its caller stopped waiting
            if continuation.is_closed() {
                continue;
            }
            let _ = continuation.send(result);
            return true;
        }
        warn!("nobody waiting for 0x{code:x}; dropping {result:x?}");
        false
    }

    /// Number of live waiters for `code`.
    pub fn waiting(&self, code: u8) -> usize {
        self.queues
            .get(&code)
            .map_or(0, |queue| queue.iter().filter(|c| !c.is_closed()).count())
    }
}
