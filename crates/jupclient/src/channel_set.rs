//
// channel_set.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The five-channel ZeroMQ connection to a kernel and the single listen loop
//! that correlates its traffic.

use std::str::FromStr;
use std::sync::Arc;

use async_channel::Receiver;
use event_listener::Event;
use tokio::{select, sync::RwLock};
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket,
    ZmqMessage,
};

use jupshared::jupyter_message::{JupyterChannel, JupyterMessage};

use crate::{
    connection_file::ConnectionFile,
    error::KernelClientError,
    execution_queue::QueuedExecution,
    jupyter_messages::{ExecutionState, JupyterMsg},
    kernel_connection::KernelConnection,
    kernel_state::{KernelState, Status},
    wire_message::WireMessage,
};

/// A command from the session's public API into the listen loop.
pub enum OutboundMessage {
    /// Execute code; the queued execution carries the resolution channel.
    Execute(QueuedExecution),

    /// Interrupt the kernel, aborting the active and queued executions.
    Interrupt,

    /// Ask the kernel to shut down.
    Shutdown { restart: bool },
}

/// The set of logical channels connecting one session to its kernel.
///
/// Owns the shell, iopub, control, and stdin sockets (the heartbeat socket
/// lives with the [`crate::heartbeat::HeartbeatMonitor`]) and the single loop
/// that consumes all inbound traffic and dispatches it into the correlator.
pub struct ChannelSet {
    pub shell_socket: Option<DealerSocket>,
    pub iopub_socket: Option<SubSocket>,
    pub control_socket: Option<DealerSocket>,
    pub stdin_socket: Option<DealerSocket>,
    connection_file: ConnectionFile,
    connection: KernelConnection,
    state: Arc<RwLock<KernelState>>,
    outbound_rx: Receiver<OutboundMessage>,
    exit_event: Arc<Event>,
    disconnected_event: Arc<Event>,
    session_id: String,
    closed: bool,
}

impl ChannelSet {
    /// Create the channel set for a kernel connection.
    ///
    /// - `connection_file`: Names the ports for each channel
    /// - `connection`: The session's identity and signing key
    /// - `state`: The session's mutable state (status + execution queue)
    /// - `outbound_rx`: Commands from the session API into the loop
    /// - `exit_event`: Fires when the kernel process exits
    /// - `disconnected_event`: Fires when the heartbeat is lost
    pub fn new(
        connection_file: ConnectionFile,
        connection: KernelConnection,
        state: Arc<RwLock<KernelState>>,
        outbound_rx: Receiver<OutboundMessage>,
        exit_event: Arc<Event>,
        disconnected_event: Arc<Event>,
    ) -> Self {
        let session_id = connection.session_id.clone();
        Self {
            shell_socket: Some(DealerSocket::with_options(Self::dealer_peer_opts(
                session_id.clone(),
            ))),
            iopub_socket: Some(SubSocket::new()),
            control_socket: Some(DealerSocket::with_options(Self::dealer_peer_opts(
                session_id.clone(),
            ))),
            stdin_socket: Some(DealerSocket::with_options(Self::dealer_peer_opts(
                session_id.clone(),
            ))),
            connection_file,
            connection,
            state,
            outbound_rx,
            exit_event,
            disconnected_event,
            session_id,
            closed: false,
        }
    }

    /// Creates the socket options for DEALER sockets to set the peer identity
    /// to the session ID.
    fn dealer_peer_opts(session_id: String) -> SocketOptions {
        let mut peer_opts = SocketOptions::default();
        if let Ok(peer_id) = PeerIdentity::from_str(session_id.as_str()) {
            peer_opts.peer_identity(peer_id);
        }
        peer_opts
    }

    /// Connect all four sockets to the kernel's ports.
    pub async fn connect(&mut self) -> Result<(), anyhow::Error> {
        // Ensure we're not closed before connecting; this makes it safe to
        // unwrap the sockets below.
        if self.closed {
            anyhow::bail!("Cannot connect; channel set is closed.");
        }

        let info = self.connection_file.info.clone();

        self.shell_socket
            .as_mut()
            .unwrap()
            .connect(self.connection_file.endpoint(info.shell_port).as_str())
            .await?;
        log::trace!(
            "[session {}] Connected to shell socket on port {}",
            self.session_id,
            info.shell_port
        );

        self.iopub_socket
            .as_mut()
            .unwrap()
            .connect(self.connection_file.endpoint(info.iopub_port).as_str())
            .await?;
        log::trace!(
            "[session {}] Connected to iopub socket on port {}",
            self.session_id,
            info.iopub_port
        );

        // Subscribe to all messages
        self.iopub_socket.as_mut().unwrap().subscribe("").await?;

        self.control_socket
            .as_mut()
            .unwrap()
            .connect(self.connection_file.endpoint(info.control_port).as_str())
            .await?;
        log::trace!(
            "[session {}] Connected to control socket on port {}",
            self.session_id,
            info.control_port
        );

        self.stdin_socket
            .as_mut()
            .unwrap()
            .connect(self.connection_file.endpoint(info.stdin_port).as_str())
            .await?;
        log::trace!(
            "[session {}] Connected to stdin socket on port {}",
            self.session_id,
            info.stdin_port
        );

        Ok(())
    }

    /// Consume inbound traffic from all channels and outbound commands from
    /// the session, until the kernel exits or the session fails.
    ///
    /// However the loop ends, pending executions are aborted and the sockets
    /// are closed before returning, so no caller is left waiting on a
    /// connection that no longer exists.
    pub async fn listen(&mut self) -> Result<(), anyhow::Error> {
        let result = self.listen_inner().await;

        log::debug!("[session {}] Ending channel listen loop", self.session_id);

        // Abort anything still pending so callers don't hang
        {
            let mut state = self.state.write().await;
            state.execution_queue.clear();
        }

        // Close the sockets. This consumes the socket, so we need to take() it.
        self.closed = true;
        if let Some(socket) = self.shell_socket.take() {
            socket.close().await;
        }
        if let Some(socket) = self.iopub_socket.take() {
            socket.close().await;
        }
        if let Some(socket) = self.control_socket.take() {
            socket.close().await;
        }
        if let Some(socket) = self.stdin_socket.take() {
            socket.close().await;
        }

        result
    }

    async fn listen_inner(&mut self) -> Result<(), anyhow::Error> {
        let session_id = self.session_id.clone();
        log::debug!("[session {}] Starting channel listen loop", session_id);

        loop {
            // The exit or disconnect notification may have landed while an
            // arm below was being processed (and so with no listener
            // registered); the status check catches it.
            {
                let state = self.state.read().await;
                if state.status.is_terminal() {
                    log::debug!(
                        "[session {}] Session is {}; ending listen loop",
                        session_id,
                        state.status
                    );
                    break;
                }
            }

            select! {
                shell_msg = self.shell_socket.as_mut().unwrap().recv() => {
                    match shell_msg {
                        Ok(msg) => {
                            self.dispatch_inbound(JupyterChannel::Shell, msg).await?;
                        },
                        Err(e) => {
                            log::error!("[session {}] Failed to receive message from shell socket: {}", session_id, e);
                            break;
                        },
                    }
                },
                iopub_msg = self.iopub_socket.as_mut().unwrap().recv() => {
                    match iopub_msg {
                        Ok(msg) => {
                            self.dispatch_inbound(JupyterChannel::IOPub, msg).await?;
                        },
                        Err(e) => {
                            log::error!("[session {}] Failed to receive message from iopub socket: {}", session_id, e);
                            break;
                        },
                    }
                },
                control_msg = self.control_socket.as_mut().unwrap().recv() => {
                    match control_msg {
                        Ok(msg) => {
                            self.dispatch_inbound(JupyterChannel::Control, msg).await?;
                        },
                        Err(e) => {
                            log::error!("[session {}] Failed to receive message from control socket: {}", session_id, e);
                            break;
                        },
                    }
                },
                stdin_msg = self.stdin_socket.as_mut().unwrap().recv() => {
                    match stdin_msg {
                        Ok(msg) => {
                            self.dispatch_inbound(JupyterChannel::Stdin, msg).await?;
                        },
                        Err(e) => {
                            log::error!("[session {}] Failed to receive message from stdin socket: {}", session_id, e);
                            break;
                        },
                    }
                },
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Ok(msg) => {
                            self.handle_outbound(msg).await?;
                        }
                        Err(_) => {
                            // The session was dropped; nothing more to do
                            log::debug!("[session {}] Session handle dropped; ending listen loop", session_id);
                            break;
                        },
                    }
                },
                _ = self.exit_event.listen() => {
                    log::debug!("[session {}] Kernel process exited; ending listen loop", session_id);
                    break;
                },
                _ = self.disconnected_event.listen() => {
                    log::debug!("[session {}] Kernel disconnected; ending listen loop", session_id);
                    break;
                },
            };
        }

        Ok(())
    }

    /// Handle a command from the session's public API.
    async fn handle_outbound(&mut self, msg: OutboundMessage) -> Result<(), anyhow::Error> {
        match msg {
            OutboundMessage::Execute(request) => {
                // Queue the message; transmit it only if nothing is in flight
                let to_send = {
                    let mut state = self.state.write().await;
                    state.execution_queue.process_request(request)
                };
                if let Some(message) = to_send {
                    self.send_jupyter(message).await?;
                }
            }
            OutboundMessage::Interrupt => {
                // An interrupt cancels the active request and any queued ones
                log::debug!("[session {}] Interrupting kernel", self.session_id);
                {
                    let mut state = self.state.write().await;
                    state.execution_queue.clear();
                }
                self.send_jupyter(JupyterMessage::interrupt_request()).await?;
            }
            OutboundMessage::Shutdown { restart } => {
                log::debug!("[session {}] Shutting down kernel", self.session_id);
                {
                    let mut state = self.state.write().await;
                    state.execution_queue.clear();
                    state.set_status(Status::Stopping, Some("shutdown requested"));
                }
                self.send_jupyter(JupyterMessage::shutdown_request(restart))
                    .await?;
            }
        }
        Ok(())
    }

    /// Sign and transmit a Jupyter message on the socket for its channel.
    async fn send_jupyter(&mut self, msg: JupyterMessage) -> Result<(), anyhow::Error> {
        if self.closed {
            anyhow::bail!("Cannot send message; channel set is closed.");
        }

        let channel = msg.channel;
        let wire_message = WireMessage::from_jupyter(msg, &self.connection)?;
        let zmq_message: ZmqMessage = wire_message.into();
        match channel {
            JupyterChannel::Shell => {
                self.shell_socket
                    .as_mut()
                    .unwrap()
                    .send(zmq_message)
                    .await?;
                log::trace!("[session {}] Sent message to shell socket", self.session_id);
            }
            JupyterChannel::Control => {
                self.control_socket
                    .as_mut()
                    .unwrap()
                    .send(zmq_message)
                    .await?;
                log::trace!("[session {}] Sent message to control socket", self.session_id);
            }
            JupyterChannel::Stdin => {
                self.stdin_socket
                    .as_mut()
                    .unwrap()
                    .send(zmq_message)
                    .await?;
                log::trace!("[session {}] Sent message to stdin socket", self.session_id);
            }
            _ => {
                log::error!(
                    "[session {}] Unsupported outbound channel: {:?}",
                    self.session_id,
                    channel
                );
            }
        }
        Ok(())
    }

    /// Verify, decode, and correlate one inbound message.
    ///
    /// Integrity violations are locally absorbed: a bad signature or an
    /// uncorrelated reply discards only the offending message.
    async fn dispatch_inbound(
        &mut self,
        channel: JupyterChannel,
        message: ZmqMessage,
    ) -> Result<(), anyhow::Error> {
        if self.closed {
            anyhow::bail!("Cannot process message; channel set is closed.");
        }

        // (1) convert the raw frames into a WireMessage
        let message = match WireMessage::from_zmq(message) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[session {}] {}", self.session_id, e);
                return Ok(());
            }
        };

        // (2) verify the signature and decode; dropped on mismatch
        let message = match message.to_jupyter(channel, &self.connection) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[session {}] {}", self.session_id, e);
                return Ok(());
            }
        };

        // (3) dispatch the typed message into the correlator
        self.correlate(message).await
    }

    /// Route a decoded message to the pending execution it belongs to.
    async fn correlate(&mut self, message: JupyterMessage) -> Result<(), anyhow::Error> {
        let typed = JupyterMsg::from(&message);
        let parent_id = message.parent_header.as_ref().map(|p| p.msg_id.as_str());

        // Whether `parent_id` names the active pending execution
        let matches_active = |state: &KernelState| {
            match (&state.execution_queue.active, parent_id) {
                (Some(active), Some(parent)) => active.msg_id == parent,
                _ => false,
            }
        };

        let next = {
            let mut state = self.state.write().await;
            match typed {
                JupyterMsg::Status(status) => match status.execution_state {
                    ExecutionState::Busy => {
                        // A kernel on its way out stays Stopping
                        if state.status == Status::Ready {
                            state.set_status(Status::Busy, None);
                        }
                        None
                    }
                    ExecutionState::Idle => {
                        if state.status == Status::Busy || state.status == Status::Starting {
                            state.set_status(Status::Ready, None);
                        }
                        if matches_active(&state) {
                            if let Some(active) = state.execution_queue.active.as_mut() {
                                active.record_idle();
                            }
                            state.execution_queue.advance()
                        } else {
                            // Idle statuses for non-execute requests (kernel
                            // info, shutdown) are routine; nothing to record.
                            None
                        }
                    }
                    ExecutionState::Starting => None,
                },
                JupyterMsg::Stream(stream) => {
                    if matches_active(&state) {
                        if let Some(active) = state.execution_queue.active.as_mut() {
                            active.append_stream(stream.name, &stream.text);
                        }
                    } else {
                        self.log_desync(&message);
                    }
                    None
                }
                JupyterMsg::ExecuteResult(result) => {
                    if matches_active(&state) {
                        if let Some(active) = state.execution_queue.active.as_mut() {
                            active.record_result(result.data);
                        }
                    } else {
                        self.log_desync(&message);
                    }
                    None
                }
                JupyterMsg::DisplayData(display) => {
                    if matches_active(&state) {
                        if let Some(active) = state.execution_queue.active.as_mut() {
                            active.record_display(display.data);
                        }
                    } else {
                        self.log_desync(&message);
                    }
                    None
                }
                JupyterMsg::Error(error) => {
                    if matches_active(&state) {
                        if let Some(active) = state.execution_queue.active.as_mut() {
                            active.record_error(error);
                        }
                    } else {
                        self.log_desync(&message);
                    }
                    None
                }
                JupyterMsg::ExecuteReply(reply) => {
                    if matches_active(&state) {
                        if let Some(active) = state.execution_queue.active.as_mut() {
                            active.record_reply(&reply);
                        }
                        state.execution_queue.advance()
                    } else {
                        self.log_desync(&message);
                        None
                    }
                }
                JupyterMsg::ExecuteInput => {
                    // Echo of our own request; nothing to record
                    None
                }
                JupyterMsg::InputRequest => {
                    // We always send allow_stdin: false, so a prompt here is a
                    // kernel bug; there is no one to answer it
                    log::warn!(
                        "[session {}] Kernel requested input but stdin is not allowed; ignoring",
                        self.session_id
                    );
                    None
                }
                JupyterMsg::Unrecognized(msg_type) => {
                    log::trace!(
                        "[session {}] Ignoring unrecognized message type '{}'",
                        self.session_id,
                        msg_type
                    );
                    None
                }
            }
        };

        // A resolved execution unblocks the next queued request
        if let Some(message) = next {
            self.send_jupyter(message).await?;
        }

        Ok(())
    }

    fn log_desync(&self, message: &JupyterMessage) {
        log::warn!(
            "[session {}] {}",
            self.session_id,
            KernelClientError::ProtocolDesync(format!(
                "{} ({})",
                message.header.msg_id, message.header.msg_type
            ))
        );
    }
}
