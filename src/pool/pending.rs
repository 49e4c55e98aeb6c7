//! Per-token queue of requests waiting for the debounce window to close.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::model::{ChartData, ChartRequest};

/// A queued request and the channel its caller is waiting on.
pub struct PendingRequest {
    pub request: ChartRequest,
    pub reply: oneshot::Sender<Result<ChartData>>,
}

#[derive(Default)]
pub struct PendingQueue {
    queues: HashMap<String, Vec<PendingRequest>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns true when it is the first one for `token`,
    /// meaning the caller has to arm the debounce timer.
    pub fn push(&mut self, token: &str, pending: PendingRequest) -> bool {
        let queue = self.queues.entry(token.to_string()).or_default();
        queue.push(pending);
        queue.len() == 1
    }

    /// Take everything queued for `token`, in arrival order.
    pub fn take(&mut self, token: &str) -> Vec<PendingRequest> {
        self.queues.remove(token).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything. Waiting callers see their channel close.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.queues.clear();
        dropped
    }
}
