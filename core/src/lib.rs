pub mod logger;
pub mod error;
pub mod value;
pub mod registry;
pub mod protocol;
pub mod transport;
pub mod client;
pub mod scheduler;
pub mod config;
pub mod http;
pub mod output;

// Re-exports for convenience
pub use client::{Completion, ConnectionState, NodetoolClient, SessionEvent, SessionHandle, SessionState};
pub use config::ClientConfig;
pub use error::{DecodeError, NodetoolError, Result};
pub use protocol::WorkflowRef;
pub use registry::TypeRegistry;
pub use scheduler::{compute_signature, Action, OnInputChangeScheduler, Signature};
pub use value::Value;
