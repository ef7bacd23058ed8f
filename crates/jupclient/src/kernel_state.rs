//
// kernel_state.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use crate::execution_queue::ExecutionQueue;

/// The lifecycle state of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The kernel process is launching; no heartbeat yet
    Starting,

    /// The kernel answered its first heartbeat and is accepting requests
    Ready,

    /// The kernel is evaluating a request
    Busy,

    /// A shutdown is in progress
    Stopping,

    /// The kernel exited as requested
    Stopped,

    /// The kernel died or stopped responding; the session is unusable
    Failed,
}

impl Status {
    /// Whether the session can accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Status::Starting => "starting",
            Status::Ready => "ready",
            Status::Busy => "busy",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The mutable state of the kernel.
///
/// Does not implement the Clone trait; only one instance of the kernel state
/// should exist at a time.
pub struct KernelState {
    /// The session ID for this kernel instance.
    pub session_id: String,

    /// The kernel's current status.
    pub status: Status,

    /// The current process ID of the kernel, or None if the kernel is not
    /// running (or was attached rather than launched).
    pub process_id: Option<u32>,

    /// The execution queue for the kernel.
    pub execution_queue: ExecutionQueue,
}

impl KernelState {
    /// Create a new kernel state.
    pub fn new(session_id: String) -> Self {
        KernelState {
            session_id,
            status: Status::Starting,
            process_id: None,
            execution_queue: ExecutionQueue::new(),
        }
    }

    /// Set the kernel's status.
    pub fn set_status(&mut self, status: Status, reason: Option<&str>) {
        log::debug!(
            "[session {}] status '{}' => '{}' {}",
            self.session_id,
            self.status,
            status,
            match reason {
                Some(r) => format!("({})", r),
                None => String::new(),
            }
        );

        // If the status didn't change, don't perform any side effects.
        if self.status == status {
            return;
        }

        self.status = status;

        // A session that can't run anything has no business holding pending
        // executions; resolve them as aborted rather than letting callers hang.
        if status.is_terminal() {
            self.execution_queue.clear();
            self.process_id = None;
        }
    }
}
