//! Pty-backed shell sessions and the registry of open terminal windows.

pub mod env;
pub mod registry;
pub mod session;

use thiserror::Error;

pub use env::{resolve_shell, ShellCommand, TermConfig, FAILSAFE_SHELL};
pub use registry::{RegistryChange, RegistryListener, SessionRegistry};
pub use session::{FinishCallback, SessionState, TerminalSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("failed to write to pty: {0}")]
    Write(String),
    #[error("failed to resize pty: {0}")]
    Resize(String),
    #[error("emulator already initialized")]
    AlreadyInitialized,
}
