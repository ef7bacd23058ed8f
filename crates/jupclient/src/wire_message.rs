//
// wire_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Framing, signing, and verification of Jupyter wire messages.

use hmac::Mac;
use serde::{Deserialize, Serialize};
use zeromq::ZmqMessage;

use jupshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};

use crate::error::KernelClientError;
use crate::kernel_connection::{KernelConnection, PROTOCOL_VERSION};

/// The frame that separates ZeroMQ routing identities from message content.
pub const MSG_DELIMITER: &[u8] = b"<IDS|MSG>";

/// The full Jupyter message header as it appears on the wire.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireMessageHeader {
    /// The message ID
    pub msg_id: String,

    /// The ID of the session
    pub session: String,

    /// The username of the message's sender
    pub username: String,

    /// The date/time the message was published, ISO 8601
    pub date: String,

    /// The type of the message
    pub msg_type: String,

    /// The version of the Jupyter protocol
    pub version: String,
}

impl WireMessageHeader {
    /// Create a full wire header from a Jupyter message header, stamping the
    /// session identity, a fresh timestamp, and the protocol version.
    pub fn new(header: JupyterMessageHeader, session_id: String, username: String) -> Self {
        let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        WireMessageHeader {
            msg_id: header.msg_id,
            msg_type: header.msg_type,
            session: session_id,
            username,
            date,
            version: String::from(PROTOCOL_VERSION),
        }
    }
}

/// A Jupyter message in its on-the-wire form: the ordered ZeroMQ frames,
/// starting at the `<IDS|MSG>` delimiter.
pub struct WireMessage {
    /// The parts of the message, as an array of byte arrays
    pub parts: Vec<Vec<u8>>,
}

impl WireMessage {
    /// Create a wire message from a Jupyter message, signing it with the
    /// session's HMAC key.
    ///
    /// The frames after the delimiter are `[signature, header, parent_header,
    /// metadata, content, ...buffers]`; the signature is the HMAC-SHA256 hex
    /// digest over the four JSON frames, or the empty string when the session
    /// has no key.
    pub fn from_jupyter(
        msg: JupyterMessage,
        connection: &KernelConnection,
    ) -> Result<Self, anyhow::Error> {
        let mut parts: Vec<Vec<u8>> = Vec::new();

        // Derive a wire message header from the Jupyter message header
        let header = WireMessageHeader::new(
            msg.header,
            connection.session_id.clone(),
            connection.username.clone(),
        );
        parts.push(serde_json::to_vec(&header)?);

        // Add the parent header, if any
        match msg.parent_header {
            Some(parent) => {
                let parent = WireMessageHeader::new(
                    parent,
                    connection.session_id.clone(),
                    connection.username.clone(),
                );
                parts.push(serde_json::to_vec(&parent)?);
            }
            None => parts.push(serde_json::to_vec(&serde_json::Map::new())?),
        }

        // Add the metadata
        parts.push(serde_json::to_vec(&msg.metadata)?);

        // Add the content
        parts.push(serde_json::to_vec(&msg.content)?);

        // Compute the HMAC signature from the existing parts and prepend it,
        // then prepend the delimiter frame
        let signature = sign_parts(connection, &parts);
        parts.insert(0, signature.into_bytes());
        parts.insert(0, MSG_DELIMITER.to_vec());

        // Buffers ride after the content, unsigned
        for buffer in msg.buffers {
            parts.push(serde_json::to_vec(&buffer)?);
        }

        Ok(WireMessage { parts })
    }

    /// Create a wire message from raw ZeroMQ frames, discarding any routing
    /// identity frames that precede the delimiter.
    pub fn from_zmq(msg: ZmqMessage) -> Result<Self, KernelClientError> {
        let frames: Vec<Vec<u8>> = msg.into_vec().into_iter().map(|b| b.to_vec()).collect();
        let delimiter = frames.iter().position(|frame| frame == MSG_DELIMITER);
        match delimiter {
            Some(pos) => Ok(WireMessage {
                parts: frames[pos..].to_vec(),
            }),
            None => Err(KernelClientError::Protocol(anyhow::anyhow!(
                "Message has no {} delimiter frame",
                String::from_utf8_lossy(MSG_DELIMITER)
            ))),
        }
    }

    /// Convert the wire message into a Jupyter message, verifying its
    /// signature against the session key.
    ///
    /// A signature mismatch means a corrupted transport or cross-session
    /// leakage; the caller drops the message and continues.
    pub fn to_jupyter(
        &self,
        channel: JupyterChannel,
        connection: &KernelConnection,
    ) -> Result<JupyterMessage, KernelClientError> {
        // delimiter + signature + the four JSON frames
        if self.parts.len() < 6 {
            return Err(KernelClientError::Protocol(anyhow::anyhow!(
                "Message has only {} frames; expected at least 6",
                self.parts.len()
            )));
        }

        let signature = String::from_utf8_lossy(&self.parts[1]).to_string();
        let expected = sign_parts(connection, &self.parts[2..6]);
        if signature != expected {
            return Err(KernelClientError::SignatureMismatch(
                String::from_utf8_lossy(&self.parts[2]).to_string(),
            ));
        }

        let header: WireMessageHeader = serde_json::from_slice(&self.parts[2])
            .map_err(|e| KernelClientError::Protocol(anyhow::anyhow!("Bad header frame: {}", e)))?;

        // An empty JSON object means no parent
        let parent_header: Option<WireMessageHeader> =
            serde_json::from_slice(&self.parts[3]).unwrap_or(None);

        let metadata: serde_json::Value = serde_json::from_slice(&self.parts[4])
            .map_err(|e| KernelClientError::Protocol(anyhow::anyhow!("Bad metadata frame: {}", e)))?;

        let content: serde_json::Value = serde_json::from_slice(&self.parts[5])
            .map_err(|e| KernelClientError::Protocol(anyhow::anyhow!("Bad content frame: {}", e)))?;

        if self.parts.len() > 6 {
            log::trace!(
                "Ignoring {} binary buffer frame(s) on {} message",
                self.parts.len() - 6,
                header.msg_type
            );
        }

        Ok(JupyterMessage {
            header: JupyterMessageHeader {
                msg_id: header.msg_id,
                msg_type: header.msg_type,
            },
            parent_header: parent_header.map(|parent| JupyterMessageHeader {
                msg_id: parent.msg_id,
                msg_type: parent.msg_type,
            }),
            channel,
            metadata,
            content,
            buffers: vec![],
        })
    }
}

impl From<WireMessage> for ZmqMessage {
    fn from(msg: WireMessage) -> ZmqMessage {
        let mut parts = msg.parts.into_iter();
        // WireMessage always carries at least the delimiter frame
        let mut zmq: ZmqMessage = parts.next().unwrap_or_default().into();
        for part in parts {
            zmq.push_back(part.into());
        }
        zmq
    }
}

/// Compute the lowercase hex HMAC-SHA256 digest over the given frames, or the
/// empty string when the connection has no signing key.
fn sign_parts(connection: &KernelConnection, parts: &[Vec<u8>]) -> String {
    match &connection.hmac_key {
        Some(hmac_key) => {
            let mut signature = hmac_key.clone();
            for part in parts {
                signature.update(part);
            }
            hex::encode(signature.finalize().into_bytes())
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(key: &str) -> KernelConnection {
        KernelConnection::new("test-session".to_string(), key.to_string()).unwrap()
    }

    fn parts() -> Vec<Vec<u8>> {
        vec![
            br#"{"msg_id":"abc"}"#.to_vec(),
            br#"{}"#.to_vec(),
            br#"{}"#.to_vec(),
            br#"{"code":"1 + 1"}"#.to_vec(),
        ]
    }

    #[test]
    fn test_signing_is_deterministic() {
        let conn = connection("0123456789abcdef0123456789abcdef");
        let first = sign_parts(&conn, &parts());
        let second = sign_parts(&conn, &parts());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_depends_on_key_and_parts() {
        let conn = connection("0123456789abcdef0123456789abcdef");
        let other_key = connection("ffffffffffffffffffffffffffffffff");
        let baseline = sign_parts(&conn, &parts());

        assert_ne!(baseline, sign_parts(&other_key, &parts()));

        let mut tampered = parts();
        tampered[3] = br#"{"code":"2 + 2"}"#.to_vec();
        assert_ne!(baseline, sign_parts(&conn, &tampered));
    }

    #[test]
    fn test_empty_key_yields_empty_signature() {
        let conn = connection("");
        assert_eq!(sign_parts(&conn, &parts()), "");
    }

    #[test]
    fn test_round_trip_preserves_message() {
        let conn = connection("0123456789abcdef0123456789abcdef");
        let msg = JupyterMessage::execute_request("1 + 1");
        let msg_id = msg.header.msg_id.clone();

        let wire = WireMessage::from_jupyter(msg, &conn).unwrap();
        let zmq: ZmqMessage = wire.into();
        let wire = WireMessage::from_zmq(zmq).unwrap();
        let round_tripped = wire.to_jupyter(JupyterChannel::Shell, &conn).unwrap();

        assert_eq!(round_tripped.header.msg_id, msg_id);
        assert_eq!(round_tripped.header.msg_type, "execute_request");
        assert!(round_tripped.parent_header.is_none());
        assert_eq!(round_tripped.content["code"], "1 + 1");
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let conn = connection("0123456789abcdef0123456789abcdef");
        let msg = JupyterMessage::execute_request("1 + 1");
        let mut wire = WireMessage::from_jupyter(msg, &conn).unwrap();

        // Flip the content frame after signing
        wire.parts[5] = br#"{"code":"malicious"}"#.to_vec();

        let result = wire.to_jupyter(JupyterChannel::Shell, &conn);
        assert!(matches!(
            result,
            Err(KernelClientError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_wrong_session_key_fails_verification() {
        let sender = connection("0123456789abcdef0123456789abcdef");
        let receiver = connection("ffffffffffffffffffffffffffffffff");
        let msg = JupyterMessage::execute_request("1 + 1");
        let wire = WireMessage::from_jupyter(msg, &sender).unwrap();

        let result = wire.to_jupyter(JupyterChannel::Shell, &receiver);
        assert!(matches!(
            result,
            Err(KernelClientError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_header_carries_session_and_version() {
        let conn = connection("0123456789abcdef0123456789abcdef");
        let msg = JupyterMessage::execute_request("1 + 1");
        let wire = WireMessage::from_jupyter(msg, &conn).unwrap();

        let header: WireMessageHeader = serde_json::from_slice(&wire.parts[2]).unwrap();
        assert_eq!(header.session, "test-session");
        assert_eq!(header.version, "5.3");
        assert!(!header.date.is_empty());
    }
}
