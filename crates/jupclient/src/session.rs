//
// session.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! A live kernel session: one kernel process, its channels, and its queue.

use std::path::PathBuf;
use std::sync::Arc;

use event_listener::Event;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{timeout, Duration};

use jupshared::jupyter_message::JupyterMessage;

use crate::{
    channel_set::{ChannelSet, OutboundMessage},
    connection_file::ConnectionFile,
    error::KernelClientError,
    execution_queue::{ExecutionResult, QueuedExecution},
    heartbeat::HeartbeatMonitor,
    kernel_connection::KernelConnection,
    kernel_process::KernelProcessSupervisor,
    kernel_spec::KernelSpec,
    kernel_state::{KernelState, Status},
};

/// How long to wait for the kernel to exit after an orderly shutdown request
/// before killing it.
const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Ports claimed by running or starting kernels, shared across sessions so
/// that two kernels never collide on a port.
pub type ReservedPorts = Arc<std::sync::RwLock<Vec<u16>>>;

/// A live connection to one kernel.
///
/// Created by [`KernelSession::start`] (launch a kernel from a spec) or
/// [`KernelSession::attach`] (connect to a kernel something else launched).
/// All methods take `&self`; a session is shared behind an `Arc` by the
/// registry.
pub struct KernelSession {
    /// The unique ID of this session; doubles as the ZeroMQ identity on the
    /// kernel's router sockets
    pub session_id: String,

    /// The name of the kernel spec this session was started from, or empty
    /// for attached sessions
    pub kernel_name: String,

    /// Shared kernel state (status + execution queue)
    state: Arc<RwLock<KernelState>>,

    /// The connection profile for this kernel
    connection_file: ConnectionFile,

    /// Where the profile was written, if this session launched the kernel
    connection_file_path: Option<PathBuf>,

    /// Commands into the channel listen loop
    outbound_tx: async_channel::Sender<OutboundMessage>,

    /// Fires when the kernel process exits
    exit_event: Arc<Event>,

    /// Fires when the kernel stops answering; also used to wake the listen
    /// loop at teardown so it can close its sockets
    disconnected_event: Arc<Event>,

    /// Kill switch for the kernel process, if this session launched it
    kill_tx: Option<async_channel::Sender<()>>,

    /// The shared reserved-port list this session's ports came from
    reserved_ports: ReservedPorts,
}

impl KernelSession {
    /// Launch a kernel from a spec and connect to it.
    ///
    /// Generates a fresh connection profile, writes it to the Jupyter runtime
    /// directory, spawns the kernel process, and waits for the kernel's first
    /// heartbeat before returning. A kernel that never heartbeats within the
    /// startup bound is killed and `StartupTimeout` is returned.
    pub async fn start(
        spec: &KernelSpec,
        reserved_ports: ReservedPorts,
    ) -> Result<Self, KernelClientError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "[session {}] Starting kernel '{}' ({})",
            session_id,
            spec.name,
            spec.display_name
        );

        let connection_file =
            ConnectionFile::generate("127.0.0.1".to_string(), reserved_ports.clone())
                .map_err(KernelClientError::ProcessStartFailed)?;

        let connection_file_path = match connection_file.write_to_runtime_dir(&session_id) {
            Ok(path) => path,
            Err(e) => {
                connection_file.release_ports(&reserved_ports);
                return Err(KernelClientError::ProcessStartFailed(e));
            }
        };

        let state = Arc::new(RwLock::new(KernelState::new(session_id.clone())));
        let exit_event = Arc::new(Event::new());

        // Spawn the kernel process and hand it to the supervisor
        let (supervisor, kill_tx) =
            KernelProcessSupervisor::new(session_id.clone(), state.clone(), exit_event.clone());
        let child = match supervisor.spawn(spec, &connection_file_path) {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&connection_file_path);
                connection_file.release_ports(&reserved_ports);
                return Err(e);
            }
        };
        {
            let mut state = state.write().await;
            state.process_id = child.id();
        }
        tokio::spawn(supervisor.run_child(child));

        let mut session = Self {
            session_id,
            kernel_name: spec.name.clone(),
            state,
            connection_file,
            connection_file_path: Some(connection_file_path),
            // Replaced by connect_channels below
            outbound_tx: async_channel::unbounded().0,
            exit_event,
            disconnected_event: Arc::new(Event::new()),
            kill_tx: Some(kill_tx),
            reserved_ports,
        };

        if let Err(e) = session.connect_channels().await {
            // The kernel never came up (or came up mute); reclaim everything
            log::error!(
                "[session {}] Kernel startup failed: {}",
                session.session_id,
                e
            );
            if let Some(kill_tx) = &session.kill_tx {
                let _ = kill_tx.send(()).await;
            }
            {
                let mut state = session.state.write().await;
                state.set_status(Status::Failed, Some("startup failed"));
            }
            session.cleanup();
            return Err(e);
        }

        Ok(session)
    }

    /// Connect to a kernel some other process launched, using its connection
    /// profile. The kernel's life is not this session's to manage: `shutdown`
    /// still asks it to exit, but there is no process to supervise or kill.
    pub async fn attach(
        connection_file: ConnectionFile,
        session_id: String,
    ) -> Result<Self, KernelClientError> {
        log::info!("[session {}] Attaching to running kernel", session_id);

        let state = Arc::new(RwLock::new(KernelState::new(session_id.clone())));
        let mut session = Self {
            session_id,
            kernel_name: String::new(),
            state,
            connection_file,
            connection_file_path: None,
            outbound_tx: async_channel::unbounded().0,
            exit_event: Arc::new(Event::new()),
            disconnected_event: Arc::new(Event::new()),
            kill_tx: None,
            reserved_ports: Arc::new(std::sync::RwLock::new(Vec::new())),
        };

        if let Err(e) = session.connect_channels().await {
            let mut state = session.state.write().await;
            state.set_status(Status::Failed, Some("attach failed"));
            drop(state);
            return Err(e);
        }

        Ok(session)
    }

    /// Wait for the kernel's first heartbeat, then bring up the four message
    /// channels and their listen loop. Shared by the start and attach paths.
    async fn connect_channels(&mut self) -> Result<(), KernelClientError> {
        // The heartbeat bounds startup: no echo, no session
        let heartbeat = HeartbeatMonitor::new(
            self.state.clone(),
            self.session_id.clone(),
            self.connection_file
                .endpoint(self.connection_file.info.hb_port),
            self.exit_event.clone(),
            self.disconnected_event.clone(),
        );
        let hb_socket = heartbeat.wait_for_echo().await?;

        {
            let mut state = self.state.write().await;
            state.set_status(Status::Ready, Some("kernel answered first heartbeat"));
        }
        heartbeat.monitor(hb_socket);

        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        self.outbound_tx = outbound_tx;

        let connection = KernelConnection::new(
            self.session_id.clone(),
            self.connection_file.info.key.clone(),
        )
        .map_err(KernelClientError::Protocol)?;
        let mut channels = ChannelSet::new(
            self.connection_file.clone(),
            connection,
            self.state.clone(),
            outbound_rx,
            self.exit_event.clone(),
            self.disconnected_event.clone(),
        );
        channels
            .connect()
            .await
            .map_err(KernelClientError::Protocol)?;

        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = channels.listen().await {
                log::error!("[session {}] Channel listener failed: {}", session_id, e);
            }
        });

        Ok(())
    }

    /// The session's current status.
    pub async fn status(&self) -> Status {
        self.state.read().await.status
    }

    /// Execute code on the kernel and wait for the aggregated result.
    ///
    /// Requests are strictly serialized: if another execution is in flight,
    /// this one waits its turn. A kernel-reported evaluation error is a
    /// successful call; it comes back inside the [`ExecutionResult`]. The
    /// call errors only when the session itself can't serve it.
    pub async fn execute(&self, code: &str) -> Result<ExecutionResult, KernelClientError> {
        // Fail fast on a dead session rather than queueing into the void
        {
            let state = self.state.read().await;
            if state.status.is_terminal() {
                return Err(KernelClientError::ProcessCrashed(None));
            }
        }

        let (tx, rx) = oneshot::channel();
        let request = QueuedExecution {
            message: JupyterMessage::execute_request(code),
            tx,
        };
        self.outbound_tx
            .send(OutboundMessage::Execute(request))
            .await
            .map_err(|_| KernelClientError::ExecutionAborted)?;

        // The queue resolves every pending execution, even on abort, so a
        // dropped sender means the session died mid-request
        rx.await.map_err(|_| KernelClientError::ExecutionAborted)
    }

    /// Interrupt the kernel, aborting the active execution and discarding any
    /// queued ones.
    pub async fn interrupt(&self) -> Result<(), KernelClientError> {
        self.outbound_tx
            .send(OutboundMessage::Interrupt)
            .await
            .map_err(|e| KernelClientError::Protocol(anyhow::anyhow!(e)))
    }

    /// Stop the session: ask the kernel to shut down, give it a grace period,
    /// and kill it if it lingers. Always reclaims the session's resources.
    pub async fn shutdown(&self) -> Result<(), KernelClientError> {
        {
            let state = self.state.read().await;
            if state.status.is_terminal() {
                log::debug!(
                    "[session {}] Session is already {}; nothing to shut down",
                    self.session_id,
                    state.status
                );
                self.cleanup();
                return Ok(());
            }
        }

        // Register for the exit notification before asking the kernel to
        // leave, so the notification can't slip past us
        let exit_listener = self.exit_event.listen();

        log::info!("[session {}] Shutting down kernel", self.session_id);
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::Shutdown { restart: false })
            .await
        {
            log::warn!(
                "[session {}] Could not send shutdown request ({}); killing kernel",
                self.session_id,
                e
            );
        }

        match timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), exit_listener).await {
            Ok(_) => {
                log::debug!(
                    "[session {}] Kernel exited within the grace period",
                    self.session_id
                );
            }
            Err(_) => match &self.kill_tx {
                Some(kill_tx) => {
                    log::warn!(
                        "[session {}] Kernel did not exit within {}s; killing it",
                        self.session_id,
                        SHUTDOWN_GRACE_SECS
                    );
                    let exit_listener = self.exit_event.listen();
                    let _ = kill_tx.send(()).await;
                    // A killed process exits promptly; don't wait forever if
                    // the supervisor is somehow gone
                    let _ =
                        timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), exit_listener).await;
                }
                None => {
                    // Attached kernel; its process was never ours to kill
                    log::debug!(
                        "[session {}] Attached kernel did not confirm exit; detaching",
                        self.session_id
                    );
                }
            },
        }

        {
            let mut state = self.state.write().await;
            state.set_status(Status::Stopped, Some("session shut down"));
        }
        // Wake the listen loop so it closes its sockets; an attached kernel
        // that never confirmed the shutdown fires no exit event
        self.disconnected_event.notify(usize::MAX);
        self.cleanup();
        Ok(())
    }

    /// Remove the connection file and release the session's ports.
    fn cleanup(&self) {
        if let Some(path) = &self.connection_file_path {
            if let Err(e) = std::fs::remove_file(path) {
                // The file is transient; a leftover is cosmetic
                log::debug!(
                    "[session {}] Could not remove connection file {:?}: {}",
                    self.session_id,
                    path,
                    e
                );
            }
        }
        self.connection_file.release_ports(&self.reserved_ports);
    }
}
