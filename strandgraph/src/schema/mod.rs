//! Runtime type tags and the process-wide type registry.
//!
//! Node input/output declarations are checked at compile time by
//! [`SchemaId`] equality; runtime payloads are `serde_json::Value`s tagged
//! with the schema they were declared under. The [`TypeRegistry`] maps a
//! schema id to its zero-value constructor, its concatenator (used when a
//! stream edge is collapsed back to an eager value), and an optional
//! field-merger for fan-in map merges.
//!
//! Chat [`Message`]s are the one built-in rich type: streamed model
//! fragments concatenate by joining content and merging tool-call
//! fragments by index.

mod ids;
mod message;
mod registry;

pub use ids::SchemaId;
pub use message::{concat_messages, Message, ToolCall};
pub use registry::{registry, RegistryError, SchemaOps, TypeRegistry};
