//
// heartbeat.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::Arc;

use event_listener::Event;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend};

use crate::error::KernelClientError;
use crate::kernel_state::{KernelState, Status};

const HB_PAYLOAD: &str = "jupclient-heartbeat";

/// How long to wait for the kernel's first heartbeat echo before declaring
/// startup a failure.
pub const STARTUP_TIMEOUT_SECS: u64 = 10;

/// How long to wait for an echo during steady-state monitoring.
const ECHO_TIMEOUT_SECS: u64 = 5;

/// The interval between heartbeat probes.
const PROBE_INTERVAL_SECS: u64 = 2;

/// A heartbeat monitor for a kernel session.
pub struct HeartbeatMonitor {
    state: Arc<RwLock<KernelState>>,
    session_id: String,
    address: String,
    exit_event: Arc<Event>,
    disconnected_event: Arc<Event>,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    ///
    /// # Arguments
    ///
    /// - `state`: The kernel state to monitor.
    /// - `session_id`: The ID of the session to monitor.
    /// - `address`: The address of the heartbeat socket.
    /// - `exit_event`: Fires when the kernel process exits; stops the monitor.
    /// - `disconnected_event`: Fired by the monitor when the kernel stops
    ///   answering; wakes the session's listen loop.
    pub fn new(
        state: Arc<RwLock<KernelState>>,
        session_id: String,
        address: String,
        exit_event: Arc<Event>,
        disconnected_event: Arc<Event>,
    ) -> Self {
        Self {
            state,
            session_id,
            address,
            exit_event,
            disconnected_event,
        }
    }

    /// Wait for the kernel's first heartbeat echo, bounding startup.
    ///
    /// Returns the connected heartbeat socket on success so that monitoring
    /// can continue on it. A kernel that never echoes within
    /// [`STARTUP_TIMEOUT_SECS`] yields `StartupTimeout`.
    pub async fn wait_for_echo(&self) -> Result<ReqSocket, KernelClientError> {
        let mut hb_socket = ReqSocket::new();
        hb_socket.connect(&self.address).await.map_err(|e| {
            KernelClientError::Protocol(anyhow::anyhow!(
                "Failed to connect to heartbeat socket: {}",
                e
            ))
        })?;
        log::info!(
            "[session {}] Connected to heartbeat socket at {}.",
            self.session_id,
            self.address
        );

        hb_socket.send(HB_PAYLOAD.into()).await.map_err(|e| {
            KernelClientError::Protocol(anyhow::anyhow!("Failed to send heartbeat: {}", e))
        })?;

        match timeout(Duration::from_secs(STARTUP_TIMEOUT_SECS), hb_socket.recv()).await {
            Ok(Ok(_)) => {
                log::info!(
                    "[session {}] Received initial heartbeat from kernel",
                    self.session_id
                );
                Ok(hb_socket)
            }
            Ok(Err(e)) => Err(KernelClientError::Protocol(anyhow::anyhow!(
                "Heartbeat socket error during startup: {}",
                e
            ))),
            Err(_) => Err(KernelClientError::StartupTimeout(STARTUP_TIMEOUT_SECS)),
        }
    }

    /// Monitor the kernel's heartbeat. Returns immediately and runs the
    /// monitor job in the background on the already-echoing socket from
    /// [`Self::wait_for_echo`].
    pub fn monitor(self, mut hb_socket: ReqSocket) {
        tokio::spawn(async move {
            loop {
                // Wait before the next heartbeat, or stop if the kernel exits
                let exit_listener = self.exit_event.listen();
                tokio::select! {
                    _ = exit_listener => {
                        log::debug!(
                            "[session {}] Stopping heartbeat monitor (exit event signaled).",
                            self.session_id
                        );
                        hb_socket.close().await;
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(PROBE_INTERVAL_SECS)) => {}
                }

                // Check if we should stop the monitor
                if self.should_stop_monitor().await {
                    hb_socket.close().await;
                    return;
                }

                // Send heartbeat
                log::trace!("[session {}] Sending heartbeat to kernel.", self.session_id);
                if let Err(e) = hb_socket.send(HB_PAYLOAD.into()).await {
                    self.mark_failed(format!("heartbeat send failed: {}", e)).await;
                    hb_socket.close().await;
                    return;
                }

                // Wait for the echo, or for the exit event
                let exit_listener = self.exit_event.listen();
                tokio::select! {
                    _ = exit_listener => {
                        log::debug!(
                            "[session {}] Stopping heartbeat monitor (exit event signaled).",
                            self.session_id
                        );
                        hb_socket.close().await;
                        return;
                    }
                    result = timeout(Duration::from_secs(ECHO_TIMEOUT_SECS), hb_socket.recv()) => {
                        match result {
                            Ok(Ok(response)) => {
                                log::trace!(
                                    "[session {}] Got heartbeat response: {:?}",
                                    self.session_id,
                                    response
                                );
                            }
                            Ok(Err(e)) => {
                                self.mark_failed(format!("heartbeat socket error: {}", e)).await;
                                hb_socket.close().await;
                                return;
                            }
                            Err(_) => {
                                self.mark_failed(format!(
                                    "no heartbeat response received after {}s",
                                    ECHO_TIMEOUT_SECS
                                ))
                                .await;
                                hb_socket.close().await;
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Check if the monitor should stop based on kernel state.
    async fn should_stop_monitor(&self) -> bool {
        let current_state = self.state.read().await;
        if current_state.status.is_terminal() || current_state.status == Status::Stopping {
            log::debug!(
                "[session {}] Stopping heartbeat monitor (kernel is {}).",
                self.session_id,
                current_state.status
            );
            true
        } else {
            false
        }
    }

    /// Mark the session failed after a lost heartbeat and wake the listen loop.
    async fn mark_failed(&self, reason: String) {
        // A shutdown in progress makes a missed echo expected; don't demote
        // the session to failed on its way out.
        {
            let mut state = self.state.write().await;
            if state.status.is_terminal() || state.status == Status::Stopping {
                return;
            }
            log::error!("[session {}] Lost heartbeat: {}", self.session_id, reason);
            state.set_status(Status::Failed, Some("lost heartbeat"));
        }
        self.disconnected_event.notify(usize::MAX);
    }
}
