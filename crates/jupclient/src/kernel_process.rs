//
// kernel_process.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Child process management for kernel sessions.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use event_listener::Event;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::sync::RwLock;

use crate::error::KernelClientError;
use crate::kernel_spec::{KernelSpec, CONNECTION_FILE_PLACEHOLDER};
use crate::kernel_state::{KernelState, Status};

/// Launches and supervises a kernel child process.
///
/// The supervisor owns the child for its whole life: it spawns it, forwards
/// its stdout/stderr to the log, waits for it to exit, and translates the
/// exit into session state. A kill request arrives over the `kill` channel.
pub struct KernelProcessSupervisor {
    /// Session ID for logging
    session_id: String,

    /// Shared kernel state
    state: Arc<RwLock<KernelState>>,

    /// Event that fires when the process exits
    exit_event: Arc<Event>,

    /// Receives a kill request from the session's stop path
    kill_rx: Receiver<()>,
}

impl KernelProcessSupervisor {
    /// Create a new process supervisor. The paired sender delivers kill
    /// requests into [`Self::run_child`].
    pub fn new(
        session_id: String,
        state: Arc<RwLock<KernelState>>,
        exit_event: Arc<Event>,
    ) -> (Self, Sender<()>) {
        let (kill_tx, kill_rx) = async_channel::bounded(1);
        (
            Self {
                session_id,
                state,
                exit_event,
                kill_rx,
            },
            kill_tx,
        )
    }

    /// Spawn the kernel process described by a kernel spec.
    ///
    /// Substitutes the connection file path into the spec's argv, applies the
    /// spec's environment on top of the inherited one, and pipes the standard
    /// streams so they can be forwarded to the log.
    pub fn spawn(
        &self,
        spec: &KernelSpec,
        connection_file_path: &Path,
    ) -> Result<tokio::process::Child, KernelClientError> {
        let argv = Self::substitute_connection_file(&spec.argv, connection_file_path);
        if argv.is_empty() {
            return Err(KernelClientError::ProcessStartFailed(anyhow::anyhow!(
                "Kernel spec '{}' has an empty argv",
                spec.name
            )));
        }

        log::info!(
            "[session {}] Starting kernel process: {}",
            self.session_id,
            argv.join(" ")
        );

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        // The spec's env values are JSON; non-string values are skipped with
        // a warning rather than failing the launch
        for (key, value) in &spec.env {
            match value.as_str() {
                Some(value) => {
                    command.env(key, value);
                }
                None => {
                    log::warn!(
                        "[session {}] Ignoring non-string env value for '{}' in kernel spec '{}'",
                        self.session_id,
                        key,
                        spec.name
                    );
                }
            }
        }

        let mut child = command.spawn().map_err(|e| {
            KernelClientError::ProcessStartFailed(anyhow::anyhow!(
                "Failed to spawn '{}': {}",
                argv[0],
                e
            ))
        })?;

        self.capture_output_streams(&mut child);
        Ok(child)
    }

    /// Substitute the connection file path into the launch arguments.
    fn substitute_connection_file(argv: &[String], connection_file_path: &Path) -> Vec<String> {
        argv.iter()
            .map(|arg| {
                if arg.contains(CONNECTION_FILE_PLACEHOLDER) {
                    arg.replace(
                        CONNECTION_FILE_PLACEHOLDER,
                        connection_file_path.to_string_lossy().as_ref(),
                    )
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    /// Forward the child's stdout and stderr to the log.
    fn capture_output_streams(&self, child: &mut tokio::process::Child) {
        if let Some(stdout) = child.stdout.take() {
            Self::stream_output(stdout, "stdout", self.session_id.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::stream_output(stderr, "stderr", self.session_id.clone());
        }
    }

    /// Monitor a child process, waiting for it to exit or for a kill request.
    ///
    /// This method blocks until the child process exits, then updates the
    /// kernel state and notifies listeners. An exit during an orderly shutdown
    /// yields `Stopped`; any other exit yields `Failed`.
    pub async fn run_child(self, mut child: tokio::process::Child) {
        let code = tokio::select! {
            status = child.wait() => self.exit_code(status),
            kill = self.kill_rx.recv() => {
                // A closed channel means the session dropped its kill handle;
                // in that case just keep waiting for the child
                if kill.is_ok() {
                    log::warn!(
                        "[session {}] Killing kernel process",
                        self.session_id
                    );
                    if let Err(e) = child.start_kill() {
                        log::error!(
                            "[session {}] Failed to kill kernel process: {}",
                            self.session_id,
                            e
                        );
                    }
                }
                self.exit_code(child.wait().await)
            },
        };

        // Translate the exit into session state: an exit we asked for is a
        // stop, anything else is a crash
        {
            let mut state = self.state.write().await;
            if state.status == Status::Stopping {
                state.set_status(Status::Stopped, Some("kernel process exited"));
            } else if !state.status.is_terminal() {
                log::error!(
                    "[session {}] {}",
                    self.session_id,
                    KernelClientError::ProcessCrashed(code)
                );
                state.set_status(Status::Failed, Some("kernel process exited unexpectedly"));
            }
        }

        // Notify anyone listening that the kernel has exited
        self.exit_event.notify(usize::MAX);
    }

    /// Log and extract the exit code from a wait result.
    fn exit_code(&self, status: std::io::Result<std::process::ExitStatus>) -> Option<i32> {
        match status {
            Ok(status) => {
                log::info!(
                    "[session {}] Kernel process exited with status: {}",
                    self.session_id,
                    status
                );
                status.code()
            }
            Err(e) => {
                log::error!(
                    "[session {}] Failed to wait on kernel process: {}",
                    self.session_id,
                    e
                );
                None
            }
        }
    }

    /// Forward one of the child's standard streams to the log, line by line.
    fn stream_output<T: AsyncRead + Unpin + Send + 'static>(
        stream: T,
        kind: &'static str,
        session_id: String,
    ) {
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(Box::pin(stream));
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match reader.read_line(&mut buffer).await {
                    Ok(0) => {
                        log::debug!("[session {}] End of kernel {} stream", session_id, kind);
                        break;
                    }
                    Ok(_) => {
                        log::debug!(
                            "[session {}] kernel {}: {}",
                            session_id,
                            kind,
                            buffer.trim_end()
                        );
                    }
                    Err(e) => {
                        log::error!(
                            "[session {}] Failed to read from kernel {}: {}",
                            session_id,
                            kind,
                            e
                        );
                        break;
                    }
                }
            }
        });
    }
}
