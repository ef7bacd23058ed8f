//
// error.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use thiserror::Error;

/// Errors surfaced to the host by the kernel client subsystem.
///
/// Kernel-reported evaluation errors are deliberately absent: a kernel that
/// raises while evaluating code is working as intended, and the error travels
/// back inside the [`crate::execution_queue::ExecutionResult`] instead.
#[derive(Error, Debug)]
pub enum KernelClientError {
    /// No installed kernel serves the requested language.
    #[error("No kernel found for language '{0}'")]
    KernelNotFound(String),

    /// The language identifier is not routed to this subsystem.
    #[error("Language '{0}' is not supported by the kernel client")]
    UnsupportedLanguage(String),

    /// The kernel process did not answer a heartbeat within the startup bound.
    #[error("Kernel did not respond to a heartbeat within {0} seconds of startup")]
    StartupTimeout(u64),

    /// The kernel process could not be spawned.
    #[error("Failed to start kernel process: {0}")]
    ProcessStartFailed(#[source] anyhow::Error),

    /// The kernel process exited while the session still needed it.
    #[error("Kernel process exited unexpectedly{}", match .0 {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    })]
    ProcessCrashed(Option<i32>),

    /// The execution was interrupted or the session stopped before it resolved.
    #[error("Execution was aborted before completion")]
    ExecutionAborted,

    /// An inbound message failed HMAC verification. The message is dropped
    /// and the session continues; this error never crosses to the host.
    #[error("HMAC signature mismatch on {0} message; message dropped")]
    SignatureMismatch(String),

    /// An inbound reply or broadcast did not correlate with any pending
    /// request. The message is dropped and the session continues.
    #[error("Message {0} has no matching pending request; message dropped")]
    ProtocolDesync(String),

    /// A session with this ID is already registered.
    #[error("Session {0} already exists")]
    SessionExists(String),

    /// No session with this ID is registered.
    #[error("Session {0} not found")]
    SessionNotFound(String),

    /// Something failed while driving the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[source] anyhow::Error),
}
