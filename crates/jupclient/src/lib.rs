//
// lib.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Kernel client subsystem.
//!
//! Executes code snippets by delegating to locally installed Jupyter kernels:
//! discovers which kernels are installed, launches a kernel subprocess bound
//! to a fresh secret-keyed connection file, speaks the signed five-channel
//! wire protocol over ZeroMQ, and correlates the asynchronous reply and
//! broadcast traffic into a single aggregated execution result.
//!
//! The host-facing entry point is [`registry::SessionRegistry`].

pub mod channel_set;
pub mod connection_file;
pub mod error;
pub mod execution_queue;
pub mod heartbeat;
pub mod jupyter_messages;
pub mod kernel_connection;
pub mod kernel_process;
pub mod kernel_spec;
pub mod kernel_state;
pub mod registry;
pub mod router;
pub mod session;
pub mod wire_message;

pub use error::KernelClientError;
pub use execution_queue::{ExecutionResult, ExecutionStatus};
pub use kernel_spec::{KernelSpec, KernelSpecRegistry};
pub use registry::SessionRegistry;
pub use router::LanguageRouter;
pub use session::KernelSession;
