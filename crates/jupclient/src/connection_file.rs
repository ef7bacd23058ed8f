//
// connection_file.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Ephemeral, secret-keyed connection profiles for kernel sessions.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use jupshared::port_picker::pick_unused_tcp_port;

/// The contents of the connection file as listed in the Jupyter specification;
/// directly serialized to/from JSON. Field names are part of the external
/// contract and must not change.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionInfo {
    /// The IP address the kernel binds its sockets to
    pub ip: String,

    /// The transport scheme (always "tcp" for local kernels)
    pub transport: String,

    /// The shell (request/reply) port
    pub shell_port: u16,

    /// The iopub (broadcast) port
    pub iopub_port: u16,

    /// The stdin (kernel-initiated input) port
    pub stdin_port: u16,

    /// The control (shutdown/interrupt) port
    pub control_port: u16,

    /// The heartbeat (echo) port
    pub hb_port: u16,

    /// The HMAC signing key: 16 random bytes, hex-encoded to 32 characters
    pub key: String,

    /// The signature scheme (always "hmac-sha256")
    pub signature_scheme: String,
}

/// A kernel connection profile and its transient on-disk representation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionFile {
    pub info: ConnectionInfo,
}

impl ConnectionFile {
    /// Create a ConnectionFile from a ConnectionInfo struct.
    pub fn from_info(info: ConnectionInfo) -> Self {
        Self { info }
    }

    /// Create a ConnectionFile by parsing the contents of a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, anyhow::Error> {
        let file = File::open(connection_file)?;
        let reader = BufReader::new(file);
        let info = serde_json::from_reader(reader)?;

        Ok(Self { info })
    }

    /// Write the profile to a file. The file is transient: the kernel reads it
    /// once at startup, after which it is safe to delete.
    pub fn to_file<P: AsRef<Path>>(&self, connection_file: P) -> Result<(), anyhow::Error> {
        let file = File::create(connection_file)?;
        serde_json::to_writer_pretty(file, &self.info)?;
        Ok(())
    }

    /// Find a free port that is not in the reserved list.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the port to find. This is used for logging.
    /// * `reserved_ports` - Ports that should not be used; generally ports
    ///   already claimed by other running or starting kernels.
    fn find_port(
        name: &str,
        reserved_ports: &Arc<RwLock<Vec<u16>>>,
    ) -> Result<u16, anyhow::Error> {
        // The number of times we've tried to find an unused, unreserved port
        let mut tries = 0;

        loop {
            let candidate = match pick_unused_tcp_port() {
                Some(port) => port,
                None => {
                    anyhow::bail!(
                        "Failed to pick {} port; no free ports available or port range exhausted",
                        name
                    );
                }
            };

            // Check if the port is reserved
            {
                let reserved_ports = reserved_ports.read().unwrap();
                if reserved_ports.contains(&candidate) {
                    // We're picking from a large range, so hitting a reserved
                    // port repeatedly means something is wrong.
                    tries += 1;
                    if tries > 10 {
                        anyhow::bail!("Failed to pick unreserved {} port after 10 tries", name);
                    }
                    log::trace!(
                        "Port {} is reserved; trying again (attempt {})",
                        candidate,
                        tries
                    );
                    continue;
                }
            }

            // Reserve the port
            {
                let mut reserved_ports = reserved_ports.write().unwrap();
                reserved_ports.push(candidate);
                log::trace!(
                    "Picked {} port: {} ({} ports reserved)",
                    name,
                    candidate,
                    reserved_ports.len()
                );
            }

            return Ok(candidate);
        }
    }

    /// Generate a new connection profile by picking five free, pairwise
    /// distinct ports and a fresh signing key.
    ///
    /// # Arguments
    ///
    /// * `ip` - The IP address to bind to
    /// * `reserved_ports` - Ports that should not be used; the five picked
    ///   ports are appended to this list.
    pub fn generate(
        ip: String,
        reserved_ports: Arc<RwLock<Vec<u16>>>,
    ) -> Result<Self, anyhow::Error> {
        use rand::Rng;

        let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
        let key = hex::encode(key_bytes);

        let control_port = Self::find_port("control", &reserved_ports)?;
        let shell_port = Self::find_port("shell", &reserved_ports)?;
        let iopub_port = Self::find_port("iopub", &reserved_ports)?;
        let hb_port = Self::find_port("heartbeat", &reserved_ports)?;
        let stdin_port = Self::find_port("stdin", &reserved_ports)?;
        let info = ConnectionInfo {
            control_port,
            shell_port,
            stdin_port,
            iopub_port,
            hb_port,
            transport: "tcp".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            key,
            ip,
        };
        Ok(Self { info })
    }

    /// Write the profile into the per-platform Jupyter runtime directory and
    /// return the file path.
    pub fn write_to_runtime_dir(&self, session_id: &str) -> Result<PathBuf, anyhow::Error> {
        let dir = runtime_dir()?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("kernel-{}.json", session_id));
        self.to_file(&path)?;
        log::debug!("Wrote connection file for session {} at {:?}", session_id, path);
        Ok(path)
    }

    /// Release this profile's ports from the shared reserved list.
    pub fn release_ports(&self, reserved_ports: &Arc<RwLock<Vec<u16>>>) {
        let mut reserved_ports = reserved_ports.write().unwrap();
        reserved_ports.retain(|&port| {
            port != self.info.control_port
                && port != self.info.shell_port
                && port != self.info.stdin_port
                && port != self.info.iopub_port
                && port != self.info.hb_port
        });
        log::trace!(
            "Released connection ports; there are now {} reserved ports",
            reserved_ports.len()
        );
    }

    /// Given a port, return a URI-like string that can be used to connect to
    /// the port, given the other parameters in the connection file.
    ///
    /// Example: `32` => `"tcp://127.0.0.1:32"`
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.info.transport, self.info.ip, port)
    }
}

/// Resolve the per-platform Jupyter runtime directory.
///
/// - Windows: `%APPDATA%/jupyter/runtime` (fallback `~/AppData/Roaming/jupyter/runtime`)
/// - macOS: `~/Library/Jupyter/runtime` (Jupyter ignores the XDG spec on macOS)
/// - elsewhere: `$XDG_RUNTIME_DIR/jupyter` if set, else `~/.local/share/jupyter/runtime`
pub fn runtime_dir() -> Result<PathBuf, anyhow::Error> {
    #[cfg(target_os = "windows")]
    {
        let base = match std::env::var_os("APPDATA") {
            Some(appdata) => PathBuf::from(appdata),
            None => home_dir()?.join("AppData").join("Roaming"),
        };
        Ok(base.join("jupyter").join("runtime"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(home_dir()?.join("Library").join("Jupyter").join("runtime"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) => Ok(PathBuf::from(dir).join("jupyter")),
            None => Ok(home_dir()?
                .join(".local")
                .join("share")
                .join("jupyter")
                .join("runtime")),
        }
    }
}

fn home_dir() -> Result<PathBuf, anyhow::Error> {
    match directories::BaseDirs::new() {
        Some(dirs) => Ok(dirs.home_dir().to_path_buf()),
        None => anyhow::bail!("Could not determine the user's home directory"),
    }
}
