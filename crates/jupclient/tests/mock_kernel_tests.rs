//
// mock_kernel_tests.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! End-to-end tests against an in-process mock kernel.
//!
//! The mock binds the five kernel-side sockets (ROUTER for shell, control,
//! and stdin; PUB for iopub; REP for heartbeat) and speaks just enough of the
//! wire protocol to exercise correlation, signing, and queueing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use jupclient::connection_file::ConnectionFile;
use jupclient::kernel_connection::KernelConnection;
use jupclient::kernel_state::Status;
use jupclient::wire_message::WireMessage;
use jupclient::{ExecutionStatus, KernelClientError, KernelSession};
use jupshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};

/// Tunable mock behaviors for fault-injection tests.
#[derive(Default, Clone)]
struct MockOptions {
    /// Publish one garbage-signed iopub message before each real sequence
    inject_bad_signature: bool,

    /// Publish one broadcast parented to a request nobody sent before each
    /// real sequence
    inject_desync: bool,

    /// Record execute requests but never answer them
    ignore_execute: bool,

    /// Stop answering heartbeats after this many echoes
    heartbeat_replies: Option<usize>,
}

/// A minimal in-process kernel.
struct MockKernel {
    connection_file: ConnectionFile,

    /// The code frames of execute requests, in arrival order
    received: Arc<Mutex<Vec<String>>>,
}

impl MockKernel {
    async fn start(options: MockOptions) -> Self {
        let reserved = Arc::new(std::sync::RwLock::new(Vec::new()));
        let connection_file = ConnectionFile::generate("127.0.0.1".to_string(), reserved)
            .expect("failed to generate connection profile");
        let info = connection_file.info.clone();
        let conn = KernelConnection::new("mock-kernel".to_string(), info.key.clone())
            .expect("failed to create mock connection identity");

        let mut shell = RouterSocket::new();
        shell
            .bind(&connection_file.endpoint(info.shell_port))
            .await
            .expect("failed to bind shell socket");
        let mut control = RouterSocket::new();
        control
            .bind(&connection_file.endpoint(info.control_port))
            .await
            .expect("failed to bind control socket");
        let mut stdin = RouterSocket::new();
        stdin
            .bind(&connection_file.endpoint(info.stdin_port))
            .await
            .expect("failed to bind stdin socket");
        let mut iopub = PubSocket::new();
        iopub
            .bind(&connection_file.endpoint(info.iopub_port))
            .await
            .expect("failed to bind iopub socket");
        let mut hb = RepSocket::new();
        hb.bind(&connection_file.endpoint(info.hb_port))
            .await
            .expect("failed to bind heartbeat socket");

        // Heartbeat echo, with an optional cap for loss-of-heartbeat tests
        let hb_limit = options.heartbeat_replies;
        tokio::spawn(async move {
            let mut echoes = 0;
            while let Ok(ping) = hb.recv().await {
                if let Some(limit) = hb_limit {
                    if echoes >= limit {
                        // Going silent: drop the socket without replying
                        break;
                    }
                }
                if hb.send(ping).await.is_err() {
                    break;
                }
                echoes += 1;
            }
        });

        // Control: acknowledge interrupt and shutdown requests
        let control_conn = conn.clone();
        tokio::spawn(async move {
            while let Ok(zmq) = control.recv().await {
                let identity = match zmq.get(0) {
                    Some(frame) => frame.to_vec(),
                    None => continue,
                };
                let request = match WireMessage::from_zmq(zmq)
                    .and_then(|wire| wire.to_jupyter(JupyterChannel::Control, &control_conn))
                {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let reply_type = match request.header.msg_type.as_str() {
                    "shutdown_request" => "shutdown_reply",
                    "interrupt_request" => "interrupt_reply",
                    _ => continue,
                };
                let reply = reply_to(&request, reply_type, serde_json::json!({"status": "ok"}));
                let _ = control
                    .send(to_router(reply, &control_conn, &identity))
                    .await;
            }
        });

        // Shell: evaluate execute requests
        let received = Arc::new(Mutex::new(Vec::new()));
        let shell_received = received.clone();
        let shell_conn = conn.clone();
        tokio::spawn(async move {
            let mut execution_count = 0i64;
            while let Ok(zmq) = shell.recv().await {
                let identity = match zmq.get(0) {
                    Some(frame) => frame.to_vec(),
                    None => continue,
                };
                let request = match WireMessage::from_zmq(zmq)
                    .and_then(|wire| wire.to_jupyter(JupyterChannel::Shell, &shell_conn))
                {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                if request.header.msg_type != "execute_request" {
                    continue;
                }
                let code = request.content["code"].as_str().unwrap_or("").to_string();
                shell_received.lock().unwrap().push(code.clone());
                if options.ignore_execute {
                    continue;
                }
                execution_count += 1;

                if options.inject_bad_signature {
                    // A message whose signature can't verify; the client must
                    // drop it and still resolve the execution
                    let mut wire = WireMessage::from_jupyter(
                        reply_to(
                            &request,
                            "status",
                            serde_json::json!({"execution_state": "busy"}),
                        ),
                        &shell_conn,
                    )
                    .unwrap();
                    wire.parts[1] = b"deadbeef".to_vec();
                    let _ = iopub.send(wire.into()).await;
                }

                if options.inject_desync {
                    // A broadcast parented to a request this client never
                    // sent; it must be dropped without disturbing the
                    // in-flight execution
                    let stranger = JupyterMessage {
                        header: JupyterMessageHeader::new("execute_request"),
                        parent_header: None,
                        channel: JupyterChannel::Shell,
                        content: serde_json::json!({}),
                        metadata: serde_json::json!({}),
                        buffers: vec![],
                    };
                    publish(&mut iopub, &shell_conn, &stranger, "execute_result",
                        serde_json::json!({
                            "data": {"text/plain": "999"},
                            "execution_count": 99,
                        })).await;
                }

                // busy -> (output) -> execute_reply -> idle
                publish(&mut iopub, &shell_conn, &request, "status",
                    serde_json::json!({"execution_state": "busy"})).await;

                if let Some(text) = code.strip_prefix("print:") {
                    publish(&mut iopub, &shell_conn, &request, "stream",
                        serde_json::json!({"name": "stdout", "text": format!("{}\n", text)})).await;
                }

                let reply_status = if let Some(message) = code.strip_prefix("err:") {
                    publish(&mut iopub, &shell_conn, &request, "error",
                        serde_json::json!({
                            "ename": "MockError",
                            "evalue": message,
                            "traceback": [format!("MockError: {}", message)],
                        })).await;
                    "error"
                } else {
                    let result = if code == "1 + 1" { "2".to_string() } else { code };
                    publish(&mut iopub, &shell_conn, &request, "execute_result",
                        serde_json::json!({
                            "data": {"text/plain": result},
                            "execution_count": execution_count,
                        })).await;
                    "ok"
                };

                let reply = reply_to(
                    &request,
                    "execute_reply",
                    serde_json::json!({
                        "status": reply_status,
                        "execution_count": execution_count,
                    }),
                );
                let _ = shell.send(to_router(reply, &shell_conn, &identity)).await;

                publish(&mut iopub, &shell_conn, &request, "status",
                    serde_json::json!({"execution_state": "idle"})).await;
            }
            // Keep stdin bound for the life of the shell task
            drop(stdin);
        });

        Self {
            connection_file,
            received,
        }
    }

    /// Attach a session to the mock.
    async fn attach(&self) -> KernelSession {
        let session = KernelSession::attach(
            self.connection_file.clone(),
            format!("test-{}", uuid::Uuid::new_v4()),
        )
        .await
        .expect("failed to attach to mock kernel");

        // Give the iopub subscription time to propagate to the publisher so
        // the first broadcasts aren't dropped
        tokio::time::sleep(Duration::from_millis(200)).await;
        session
    }
}

/// Build a reply carrying the request's header as its parent.
fn reply_to(request: &JupyterMessage, msg_type: &str, content: serde_json::Value) -> JupyterMessage {
    JupyterMessage {
        header: JupyterMessageHeader::new(msg_type),
        parent_header: Some(request.header.clone()),
        channel: JupyterChannel::Shell,
        content,
        metadata: serde_json::json!({}),
        buffers: vec![],
    }
}

/// Frame a message for a ROUTER socket by prepending the peer identity.
fn to_router(msg: JupyterMessage, conn: &KernelConnection, identity: &[u8]) -> ZmqMessage {
    let wire = WireMessage::from_jupyter(msg, conn).expect("failed to sign message");
    let mut zmq: ZmqMessage = wire.into();
    zmq.push_front(identity.to_vec().into());
    zmq
}

/// Publish a parented broadcast on the iopub socket.
async fn publish(
    iopub: &mut PubSocket,
    conn: &KernelConnection,
    request: &JupyterMessage,
    msg_type: &str,
    content: serde_json::Value,
) {
    let msg = reply_to(request, msg_type, content);
    let wire = WireMessage::from_jupyter(msg, conn).expect("failed to sign broadcast");
    let _ = iopub.send(wire.into()).await;
}

#[tokio::test]
async fn test_execute_round_trip() {
    let kernel = MockKernel::start(MockOptions::default()).await;
    let session = kernel.attach().await;

    assert_eq!(session.status().await, Status::Ready);

    let result = session.execute("1 + 1").await.expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.text(), Some("2"));
    assert_eq!(result.execution_count, Some(1));
}

#[tokio::test]
async fn test_back_to_back_executions_are_serialized() {
    let kernel = MockKernel::start(MockOptions::default()).await;
    let session = kernel.attach().await;

    let (first, second) = tokio::join!(session.execute("first"), session.execute("second"));
    let first = first.expect("first execution failed");
    let second = second.expect("second execution failed");

    // The second request reached the kernel only after the first resolved
    assert_eq!(
        *kernel.received.lock().unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(first.execution_count, Some(1));
    assert_eq!(second.execution_count, Some(2));
    assert_eq!(first.text(), Some("first"));
    assert_eq!(second.text(), Some("second"));
}

#[tokio::test]
async fn test_stream_output_is_captured() {
    let kernel = MockKernel::start(MockOptions::default()).await;
    let session = kernel.attach().await;

    let result = session.execute("print:hello").await.expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.stdout, "hello\n");
}

#[tokio::test]
async fn test_kernel_error_travels_inside_the_result() {
    let kernel = MockKernel::start(MockOptions::default()).await;
    let session = kernel.attach().await;

    // An evaluation error is a successful call with an error-status result
    let result = session.execute("err:boom").await.expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Error);
    let error = result.error.expect("missing error details");
    assert_eq!(error.ename, "MockError");
    assert_eq!(error.evalue, "boom");
    assert!(!error.traceback.is_empty());
}

#[tokio::test]
async fn test_bad_signature_is_absorbed() {
    let kernel = MockKernel::start(MockOptions {
        inject_bad_signature: true,
        ..Default::default()
    })
    .await;
    let session = kernel.attach().await;

    // The garbage-signed broadcast is dropped; the execution still resolves
    let result = session.execute("1 + 1").await.expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.text(), Some("2"));
}

#[tokio::test]
async fn test_unmatched_parent_is_absorbed() {
    let kernel = MockKernel::start(MockOptions {
        inject_desync: true,
        ..Default::default()
    })
    .await;
    let session = kernel.attach().await;

    // The stray broadcast correlates with nothing and is dropped; the real
    // execution is untouched by its payload
    let result = session.execute("1 + 1").await.expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.text(), Some("2"));
    assert_eq!(result.execution_count, Some(1));
}

#[tokio::test]
async fn test_interrupt_aborts_active_and_queued() {
    // The mock swallows execute requests, so only an interrupt can resolve them
    let kernel = MockKernel::start(MockOptions {
        ignore_execute: true,
        ..Default::default()
    })
    .await;
    let session = kernel.attach().await;

    let (first, second, interrupt) = tokio::join!(
        session.execute("first"),
        session.execute("second"),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            session.interrupt().await
        }
    );
    interrupt.expect("interrupt failed");

    assert_eq!(
        first.expect("first execution failed").status,
        ExecutionStatus::Aborted
    );
    assert_eq!(
        second.expect("second execution failed").status,
        ExecutionStatus::Aborted
    );

    // The queued request was never transmitted
    assert_eq!(*kernel.received.lock().unwrap(), vec!["first".to_string()]);
}

#[tokio::test]
async fn test_shutdown_aborts_pending_execution() {
    let kernel = MockKernel::start(MockOptions {
        ignore_execute: true,
        ..Default::default()
    })
    .await;
    let session = kernel.attach().await;

    // The kernel never answers, so the execution can only resolve through
    // the shutdown path
    let (result, shutdown) = tokio::join!(session.execute("never"), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.shutdown().await
    });
    shutdown.expect("shutdown failed");

    assert_eq!(
        result.expect("execution should resolve, not hang").status,
        ExecutionStatus::Aborted
    );
    assert_eq!(session.status().await, Status::Stopped);
}

#[tokio::test]
async fn test_lost_heartbeat_fails_the_session() {
    // The mock answers the startup echo, then goes silent
    let kernel = MockKernel::start(MockOptions {
        heartbeat_replies: Some(1),
        ..Default::default()
    })
    .await;
    let session = kernel.attach().await;
    assert_eq!(session.status().await, Status::Ready);

    // The monitor probes every couple of seconds and gives up after a missed
    // echo; wait for it to notice
    let mut failed = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if session.status().await == Status::Failed {
            failed = true;
            break;
        }
    }
    assert!(failed, "session should fail after losing its heartbeat");

    // Subsequent executions fail fast instead of hanging
    let result = session.execute("1 + 1").await;
    assert!(matches!(
        result,
        Err(KernelClientError::ProcessCrashed(_) | KernelClientError::ExecutionAborted)
    ));
}
