//! Agent Session Bridge
//!
//! A library for driving interchangeable coding-agent backends through one
//! uniform session protocol: per-conversation state machines that start and
//! resume backend execution handles, convert native event streams into
//! ordered protocol notifications, arbitrate tool permissions with the
//! client, and replay persisted history after restarts.
//!
//! # Overview
//!
//! - [`SessionRegistry`] - one record per conversation, routed to the right
//!   adapter variant
//! - [`Agent`] - the uniform backend contract with two implementations:
//!   [`ClaudeAgent`] (supervised CLI subprocess) and [`ThreadAgent`]
//!   (native thread stream)
//! - [`evaluate_tool_use`] - the permission decision table
//! - [`PersistenceBridge`] - append-only notification logging and replay
//!
//! # Example
//!
//! ```ignore
//! use bridge_session_lib::{
//!     AdapterKind, ClaudeAgent, ClaudeAgentConfig, ClientHandle, FileHistoryStore,
//!     NewSessionOptions, PersistenceBridge, ProcessSupervisor, SessionRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (client, mut notifications, mut permissions) = ClientHandle::channel();
//!     let persistence = Arc::new(PersistenceBridge::new(Arc::new(
//!         FileHistoryStore::new(FileHistoryStore::default_root()?)?,
//!     )));
//!
//!     let claude = Arc::new(ClaudeAgent::new(
//!         ClaudeAgentConfig::default(),
//!         Arc::new(ProcessSupervisor::new()),
//!         persistence.clone(),
//!         client,
//!     ));
//!     let registry = SessionRegistry::new(AdapterKind::Subprocess).with_adapter(claude);
//!
//!     let session = registry
//!         .create(None, std::env::current_dir()?.as_path(), NewSessionOptions::default())
//!         .await?;
//!     let result = registry
//!         .prompt(&session.session_id, vec![shared::ContentBlock::text("hello")])
//!         .await?;
//!     println!("turn ended: {:?}", result.stop_reason);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod claude;
pub mod client;
pub mod convert;
pub mod error;
pub mod history;
pub mod permissions;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod terminal;
pub mod thread;
pub mod thread_agent;
pub mod thread_convert;
pub mod tool_use;

// Re-export main types at crate root
pub use agent::{AdapterKind, Agent, NewSessionOptions, EXT_NATIVE_SESSION_ID};
pub use claude::{ClaudeAgent, ClaudeAgentConfig};
pub use client::{ClientHandle, PermissionRequest};
pub use convert::{convert_claude_output, Converted, TurnOutcome};
pub use error::BridgeError;
pub use history::{FileHistoryStore, HistoryStore, LogRecord, MemoryHistoryStore, PersistenceBridge};
pub use permissions::{evaluate_tool_use, PermissionDecision, EXIT_PLAN_TOOL, FILE_EDIT_TOOLS};
pub use registry::SessionRegistry;
pub use session::SessionState;
pub use supervisor::{ProcessSupervisor, SpawnInfo, SupervisedProcess};
pub use terminal::{BackgroundTerminals, TerminalHandle, TerminalStatus};
pub use thread::{jsonl_thread_handle, ThreadEvent, ThreadHandle, ThreadItem, ThreadTransport, TurnRequest};
pub use thread_agent::{ThreadAgent, ThreadAgentConfig};
pub use thread_convert::convert_thread_event;
pub use tool_use::{ToolUseCache, ToolUseEntry, ToolUseKind};
