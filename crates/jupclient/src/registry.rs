//
// registry.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The host-facing surface: an owned registry of live kernel sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::{
    error::KernelClientError,
    execution_queue::ExecutionResult,
    kernel_spec::{KernelSpec, KernelSpecRegistry},
    router::LanguageRouter,
    session::{KernelSession, ReservedPorts},
};

/// An explicitly constructed, owned registry of kernel sessions.
///
/// The host creates one of these at startup and passes it by reference to
/// everything that needs kernels; there is no ambient global. Dropping the
/// registry does not stop its sessions; call [`Self::shutdown_all`] first.
pub struct SessionRegistry {
    /// The installed kernels, discovered once at construction
    kernel_specs: KernelSpecRegistry,

    /// Routes language identifiers to kernel languages
    router: LanguageRouter,

    /// Live sessions by session ID. A std mutex, never held across an await.
    sessions: Mutex<HashMap<String, Arc<KernelSession>>>,

    /// Ports claimed by running kernels, shared with every session so new
    /// profiles avoid them
    reserved_ports: ReservedPorts,
}

impl SessionRegistry {
    /// Create a registry over a fixed set of kernel specs.
    pub fn new(kernel_specs: KernelSpecRegistry) -> Self {
        Self {
            kernel_specs,
            router: LanguageRouter::new(),
            sessions: Mutex::new(HashMap::new()),
            reserved_ports: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    /// Create a registry over the kernels installed on this machine.
    pub async fn with_discovered_kernels() -> Self {
        Self::new(KernelSpecRegistry::discover().await)
    }

    /// The kernel specs this registry resolves against.
    pub fn kernel_specs(&self) -> &KernelSpecRegistry {
        &self.kernel_specs
    }

    /// Resolve a language identifier to a launchable kernel spec, or `None`
    /// when the identifier is not served here or no kernel is installed for
    /// it. Never errors.
    pub fn resolve_language(&self, id: &str) -> Option<&KernelSpec> {
        match self.router.resolve(&self.kernel_specs, id) {
            Ok(spec) => Some(spec),
            Err(e) => {
                log::debug!("Could not resolve language '{}': {}", id, e);
                None
            }
        }
    }

    /// Start a session for a kernel spec. Returns the new session's ID.
    pub async fn start_session(&self, spec: &KernelSpec) -> Result<String, KernelClientError> {
        let session = KernelSession::start(spec, self.reserved_ports.clone()).await?;
        let session_id = session.session_id.clone();
        self.register(Arc::new(session))?;
        Ok(session_id)
    }

    /// Resolve a language identifier and start a session for it in one step.
    pub async fn start_for_language(&self, id: &str) -> Result<String, KernelClientError> {
        // The spec reference can't be held across the session start; clone it
        let spec = self.router.resolve(&self.kernel_specs, id)?.clone();
        self.start_session(&spec).await
    }

    /// Adopt an externally created session (typically one attached to an
    /// already-running kernel).
    pub fn register(&self, session: Arc<KernelSession>) -> Result<(), KernelClientError> {
        let mut sessions = self.lock_sessions();
        if sessions.contains_key(&session.session_id) {
            return Err(KernelClientError::SessionExists(
                session.session_id.clone(),
            ));
        }
        log::info!("[session {}] Registered session", session.session_id);
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    /// Look up a live session by ID.
    pub fn get(&self, session_id: &str) -> Result<Arc<KernelSession>, KernelClientError> {
        self.lock_sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| KernelClientError::SessionNotFound(session_id.to_string()))
    }

    /// Execute code on a session and wait for the aggregated result.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
    ) -> Result<ExecutionResult, KernelClientError> {
        let session = self.get(session_id)?;
        session.execute(code).await
    }

    /// Interrupt a session's active execution.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), KernelClientError> {
        let session = self.get(session_id)?;
        session.interrupt().await
    }

    /// Stop a session and remove it from the registry.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), KernelClientError> {
        let session = self.get(session_id)?;
        session.shutdown().await?;
        self.lock_sessions().remove(session_id);
        log::info!("[session {}] Removed session", session_id);
        Ok(())
    }

    /// Stop every live session. Called by the host at shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<KernelSession>> =
            self.lock_sessions().values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.shutdown().await {
                log::warn!(
                    "[session {}] Failed to shut down session: {}",
                    session.session_id,
                    e
                );
            }
            self.lock_sessions().remove(&session.session_id);
        }
    }

    /// The IDs of all live sessions.
    pub fn list_sessions(&self) -> Vec<String> {
        self.lock_sessions().keys().cloned().collect()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<KernelSession>>> {
        // A poisoned session map is unrecoverable; holders only insert and
        // remove, so poisoning indicates a bug rather than bad data
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, language: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            argv: vec![
                "run-kernel".to_string(),
                "-f".to_string(),
                "{connection_file}".to_string(),
            ],
            display_name: name.to_string(),
            language: language.to_string(),
            resource_dir: String::new(),
            env: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_resolve_language_degrades_to_none() {
        let registry = SessionRegistry::new(KernelSpecRegistry::from_specs(vec![spec(
            "python3", "python",
        )]));
        assert!(registry.resolve_language("python").is_some());
        assert!(registry.resolve_language("jupyter-python").is_some());
        // Not routed here
        assert!(registry.resolve_language("fortran").is_none());
        // Routed here but no kernel installed
        assert!(registry.resolve_language("julia").is_none());
    }

    #[test]
    fn test_get_unknown_session() {
        let registry = SessionRegistry::new(KernelSpecRegistry::new());
        assert!(matches!(
            registry.get("no-such-session"),
            Err(KernelClientError::SessionNotFound(_))
        ));
    }
}
