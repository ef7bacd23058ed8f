//! Shared wire-level types for the Jupyter kernel client.

/// Jupyter message types
pub mod jupyter_message;

/// TCP port allocation
pub mod port_picker;
