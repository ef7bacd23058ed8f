//
// jupyter_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::iter;

/// The (partial) header of a Jupyter message.
///
/// Additional header fields (session ID, username, date, protocol version) are
/// not included here; they are populated when the message is serialized for
/// the ZeroMQ socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JupyterMessageHeader {
    /// The message ID
    pub msg_id: String,
    /// The type of the message
    pub msg_type: String,
}

impl JupyterMessageHeader {
    /// Create a header with a fresh random message ID.
    pub fn new(msg_type: &str) -> Self {
        Self {
            msg_id: make_message_id(),
            msg_type: msg_type.to_string(),
        }
    }
}

/// The set of all Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,

    /// The heartbeat channel
    Heartbeat,
}

/// A serialized Jupyter message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this message)
    pub parent_header: Option<JupyterMessageHeader>,

    /// The channel on which the message was sent (or is to be sent)
    pub channel: JupyterChannel,

    /// The message payload
    pub content: serde_json::Value,

    /// Additional metadata
    pub metadata: serde_json::Value,

    /// The message buffers
    pub buffers: Vec<serde_json::Value>,
}

impl JupyterMessage {
    /// Create an `execute_request` message for the given code.
    pub fn execute_request(code: &str) -> Self {
        Self {
            header: JupyterMessageHeader::new("execute_request"),
            parent_header: None,
            channel: JupyterChannel::Shell,
            content: serde_json::json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
            metadata: serde_json::json!({}),
            buffers: vec![],
        }
    }

    /// Create an `interrupt_request` message.
    pub fn interrupt_request() -> Self {
        Self {
            header: JupyterMessageHeader::new("interrupt_request"),
            parent_header: None,
            channel: JupyterChannel::Control,
            content: serde_json::json!({}),
            metadata: serde_json::json!({}),
            buffers: vec![],
        }
    }

    /// Create a `shutdown_request` message.
    pub fn shutdown_request(restart: bool) -> Self {
        Self {
            header: JupyterMessageHeader::new("shutdown_request"),
            parent_header: None,
            channel: JupyterChannel::Control,
            content: serde_json::json!({
                "restart": restart,
            }),
            metadata: serde_json::json!({}),
            buffers: vec![],
        }
    }
}

/// Generate a unique message ID for Jupyter messages.
///
/// # Returns
///
/// A random hexadecimal string of 10 characters.
pub fn make_message_id() -> String {
    let mut rng = rand::thread_rng();
    iter::repeat_with(|| format!("{:x}", rng.gen_range(0..16)))
        .take(10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_message_id() {
        let id = make_message_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, make_message_id());
    }

    #[test]
    fn test_execute_request_content() {
        let msg = JupyterMessage::execute_request("1 + 1");
        assert_eq!(msg.header.msg_type, "execute_request");
        assert_eq!(msg.channel, JupyterChannel::Shell);
        assert_eq!(msg.content["code"], "1 + 1");
        assert_eq!(msg.content["silent"], false);
        assert_eq!(msg.content["store_history"], true);
        assert_eq!(msg.content["allow_stdin"], false);
        assert_eq!(msg.content["stop_on_error"], true);
    }

    #[test]
    fn test_shutdown_request_content() {
        let msg = JupyterMessage::shutdown_request(false);
        assert_eq!(msg.channel, JupyterChannel::Control);
        assert_eq!(msg.content["restart"], false);
    }
}
