//! BPMN process execution runtime.
//!
//! A process instance is an [`tree::ExecutionTree`] of executions moved
//! through a [`model::ProcessDefinition`] by the interpreter in [`vm`].
//! [`engine::Engine`] wraps the interpreter with persistence and per-instance
//! serialisation.

pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod model;
pub mod store;
pub mod store_memory;
pub mod tree;
pub mod types;
pub mod vm;
pub mod walker;

pub use config::{EngineConfig, UnhandledErrorPolicy};
pub use delegate::{HandlerOutcome, Services, TaskContext, TaskFailure};
pub use engine::Engine;
pub use error::{EngineError, ModelError};
pub use events::RuntimeEvent;
pub use model::{ProcessBuilder, ProcessDefinition, Repository};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::{ExecutionId, ProcessInstance, ProcessState, Value};
