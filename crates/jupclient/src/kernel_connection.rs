//
// kernel_connection.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// The username stamped on outgoing message headers.
pub const USERNAME: &str = "kernel";

/// The Jupyter wire protocol version spoken by this client.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Connection identity for one kernel session: who we are on the wire and how
/// messages are signed.
#[derive(Debug, Clone)]
pub struct KernelConnection {
    /// The ID of the session
    pub session_id: String,

    /// The username of the user who owns the session
    pub username: String,

    /// The signing key, as a string
    pub key: Option<String>,

    /// The HMAC key used to sign messages, if any
    pub hmac_key: Option<Hmac<Sha256>>,
}

impl KernelConnection {
    /// Create a connection identity for a session. An empty key disables
    /// signing, per the Jupyter specification.
    pub fn new(session_id: String, key: String) -> Result<Self, anyhow::Error> {
        let (key, hmac_key) = if key.is_empty() {
            (None, None)
        } else {
            let hmac_key = Hmac::<Sha256>::new_from_slice(key.as_bytes())?;
            (Some(key), Some(hmac_key))
        };

        Ok(Self {
            session_id,
            username: USERNAME.to_string(),
            key,
            hmac_key,
        })
    }
}
