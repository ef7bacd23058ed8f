//
// execution_queue.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Pending execution state and the FIFO gate that serializes requests.

use std::collections::VecDeque;

use jupshared::jupyter_message::JupyterMessage;
use tokio::sync::oneshot;

use crate::jupyter_messages::{JupyterError, JupyterExecuteReply, ReplyStatus, StreamName};

/// The final disposition of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The kernel evaluated the code successfully.
    Ok,
    /// The kernel raised while evaluating the code (not a system fault).
    Error,
    /// The execution was interrupted, cancelled, or lost to a dead kernel.
    Aborted,
}

/// The aggregated result of one execution: everything the kernel said about
/// the request, collapsed into a single value once both completion signals
/// have been observed.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,

    /// Stream output, concatenated in arrival order
    pub stdout: String,
    pub stderr: String,

    /// Display payloads (mime-type maps) in emission order
    pub display_payloads: Vec<serde_json::Map<String, serde_json::Value>>,

    /// The mime-type map of the latest `execute_result`; the canonical return
    /// value of the execution
    pub data: serde_json::Map<String, serde_json::Value>,

    /// The kernel's execution counter, from the reply
    pub execution_count: Option<i64>,

    /// Error details when the kernel reported one
    pub error: Option<JupyterError>,
}

impl ExecutionResult {
    fn new() -> Self {
        Self {
            status: ExecutionStatus::Ok,
            stdout: String::new(),
            stderr: String::new(),
            display_payloads: Vec::new(),
            data: serde_json::Map::new(),
            execution_count: None,
            error: None,
        }
    }

    /// The `text/plain` rendering of the result, if the kernel produced one.
    pub fn text(&self) -> Option<&str> {
        self.data.get("text/plain").and_then(|value| value.as_str())
    }
}

/// An execution request that has been transmitted to the kernel and is
/// accumulating replies and broadcasts, keyed by the request's message ID.
///
/// Resolves exactly once: when both the shell reply and the idle status have
/// been observed (in either order), or when aborted.
pub struct PendingExecution {
    /// The message ID of the originating request
    pub msg_id: String,

    /// True once the `execute_reply` arrived on the shell channel
    pub reply_received: bool,

    /// True once the `idle` status for this request arrived on iopub
    pub idle_observed: bool,

    result: ExecutionResult,

    /// Resolution channel; taken when the execution resolves
    tx: Option<oneshot::Sender<ExecutionResult>>,
}

impl PendingExecution {
    pub fn new(msg_id: String, tx: oneshot::Sender<ExecutionResult>) -> Self {
        Self {
            msg_id,
            reply_received: false,
            idle_observed: false,
            result: ExecutionResult::new(),
            tx: Some(tx),
        }
    }

    /// Append stream output in arrival order.
    pub fn append_stream(&mut self, name: StreamName, text: &str) {
        match name {
            StreamName::Stdout => self.result.stdout.push_str(text),
            StreamName::Stderr => self.result.stderr.push_str(text),
        }
    }

    /// Record a `display_data` payload.
    pub fn record_display(&mut self, data: serde_json::Map<String, serde_json::Value>) {
        self.result.display_payloads.push(data);
    }

    /// Record an `execute_result` payload. The latest one is the canonical
    /// return value.
    pub fn record_result(&mut self, data: serde_json::Map<String, serde_json::Value>) {
        self.result.display_payloads.push(data.clone());
        self.result.data = data;
    }

    /// Record a kernel-reported evaluation error.
    pub fn record_error(&mut self, error: JupyterError) {
        self.result.status = ExecutionStatus::Error;
        self.result.error = Some(error);
    }

    /// Record the shell `execute_reply`.
    pub fn record_reply(&mut self, reply: &JupyterExecuteReply) {
        self.reply_received = true;
        self.result.execution_count = reply.execution_count;
        match reply.status {
            ReplyStatus::Ok => {}
            ReplyStatus::Error => self.result.status = ExecutionStatus::Error,
            ReplyStatus::Aborted => self.result.status = ExecutionStatus::Aborted,
        }
    }

    /// Record the `idle` status broadcast for this request.
    pub fn record_idle(&mut self) {
        self.idle_observed = true;
    }

    /// Whether both completion signals have been observed.
    pub fn is_complete(&self) -> bool {
        self.reply_received && self.idle_observed
    }

    /// Resolve the execution, delivering the aggregated result to the caller.
    pub fn resolve(mut self) {
        if let Some(tx) = self.tx.take() {
            // The caller may have gone away; that's not our problem
            let _ = tx.send(self.result);
        }
    }

    /// Resolve the execution as aborted, regardless of what has been observed.
    pub fn abort(mut self) {
        self.result.status = ExecutionStatus::Aborted;
        self.resolve();
    }
}

/// An execution request waiting its turn. Kernels execute serially, so only
/// one request is ever in flight; the rest wait here.
pub struct QueuedExecution {
    pub message: JupyterMessage,
    pub tx: oneshot::Sender<ExecutionResult>,
}

/// The per-session execution queue: at most one active (transmitted) request
/// and a FIFO of requests that have not been sent yet.
#[derive(Default)]
pub struct ExecutionQueue {
    pub active: Option<PendingExecution>,
    pub pending: VecDeque<QueuedExecution>,
}

impl ExecutionQueue {
    /// Create a new execution queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a given request, either activating it for immediate
    /// transmission or queueing it for later.
    ///
    /// Returns the message to transmit now, or None if the request was queued.
    pub fn process_request(&mut self, request: QueuedExecution) -> Option<JupyterMessage> {
        match &self.active {
            None => {
                log::trace!(
                    "Executing request {} immediately (no requests are waiting)",
                    request.message.header.msg_id
                );
                self.active = Some(PendingExecution::new(
                    request.message.header.msg_id.clone(),
                    request.tx,
                ));
                Some(request.message)
            }
            Some(active) => {
                log::debug!(
                    "Queueing request {} (active request is {}; there are {} pending requests)",
                    request.message.header.msg_id,
                    active.msg_id,
                    self.pending.len()
                );
                self.pending.push_back(request);
                None
            }
        }
    }

    /// Resolve the active execution if it has observed both completion
    /// signals, and return the next queued message to transmit, if any.
    pub fn advance(&mut self) -> Option<JupyterMessage> {
        if !self.active.as_ref().is_some_and(|active| active.is_complete()) {
            return None;
        }
        if let Some(active) = self.active.take() {
            log::trace!("Request {} complete; resolving", active.msg_id);
            active.resolve();
        }
        self.next_request()
    }

    /// Gets the next request to transmit, activating it.
    fn next_request(&mut self) -> Option<JupyterMessage> {
        let request = self.pending.pop_front()?;
        log::debug!(
            "Executing pending request {} ({} pending requests remain)",
            request.message.header.msg_id,
            self.pending.len()
        );
        self.active = Some(PendingExecution::new(
            request.message.header.msg_id.clone(),
            request.tx,
        ));
        Some(request.message)
    }

    /// Clear the queue, resolving the active execution and every queued one
    /// as aborted.
    pub fn clear(&mut self) {
        if let Some(active) = self.active.take() {
            active.abort();
        }
        if !self.pending.is_empty() {
            log::debug!(
                "Discarding {} pending execution requests",
                self.pending.len()
            );
        }
        for queued in self.pending.drain(..) {
            PendingExecution::new(queued.message.header.msg_id, queued.tx).abort();
        }
    }
}
