use std::sync::{Arc, OnceLock};

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use super::ids::SchemaId;
use super::message::{concat_messages, Message};

/// Errors surfaced by registry lookups and registered operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// No concatenator is registered for the schema; a stream of this type
    /// cannot be collapsed to an eager value.
    #[error("no concatenator registered for schema `{schema}`")]
    #[diagnostic(
        code(strandgraph::registry::missing_concatenator),
        help("Register SchemaOps for this schema id before compiling graphs that concat it.")
    )]
    MissingConcatenator { schema: SchemaId },

    /// No field-merger is registered for the schema.
    #[error("no field merger registered for schema `{schema}`")]
    #[diagnostic(code(strandgraph::registry::missing_merger))]
    MissingMerger { schema: SchemaId },

    /// A registered operation rejected its input.
    #[error("schema operation failed for `{schema}`: {message}")]
    #[diagnostic(code(strandgraph::registry::op_failed))]
    OpFailed { schema: SchemaId, message: String },

    #[error(transparent)]
    #[diagnostic(code(strandgraph::registry::serde_json))]
    Serde(#[from] serde_json::Error),
}

type ConcatFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, RegistryError> + Send + Sync>;
type MergeFn = Arc<dyn Fn(Vec<(String, Value)>) -> Result<Value, RegistryError> + Send + Sync>;
type ZeroFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Operations registered for one schema id.
///
/// `tag` identifies the implementation: registering the same `(id, tag)`
/// pair twice is an idempotent no-op, while registering a different tag
/// under an existing id is a programmer-fatal collision.
#[derive(Clone)]
pub struct SchemaOps {
    /// Implementation tag used for the idempotence check.
    pub tag: &'static str,
    /// Zero-value constructor (result of concatenating an empty stream).
    pub zero: ZeroFn,
    /// Reduce an ordered chunk sequence to one value.
    pub concat: Option<ConcatFn>,
    /// Merge named fan-in slots into one value.
    pub merge_fields: Option<MergeFn>,
}

impl SchemaOps {
    /// Ops with a zero value only; concat and merge stay unregistered.
    pub fn new(tag: &'static str, zero: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            tag,
            zero: Arc::new(zero),
            concat: None,
            merge_fields: None,
        }
    }

    #[must_use]
    pub fn with_concat(
        mut self,
        concat: impl Fn(Vec<Value>) -> Result<Value, RegistryError> + Send + Sync + 'static,
    ) -> Self {
        self.concat = Some(Arc::new(concat));
        self
    }

    #[must_use]
    pub fn with_merge_fields(
        mut self,
        merge: impl Fn(Vec<(String, Value)>) -> Result<Value, RegistryError> + Send + Sync + 'static,
    ) -> Self {
        self.merge_fields = Some(Arc::new(merge));
        self
    }
}

/// Process-wide mapping from schema id to registered operations.
///
/// Obtain the shared instance with [`registry`]. Built-in schemas
/// (`string`, `number`, `json`, `message`, `messages`) are registered at
/// first access.
pub struct TypeRegistry {
    ops: RwLock<FxHashMap<SchemaId, SchemaOps>>,
}

impl TypeRegistry {
    fn with_builtins() -> Self {
        let reg = TypeRegistry {
            ops: RwLock::new(FxHashMap::default()),
        };

        reg.register(
            SchemaId::string(),
            SchemaOps::new("builtin.string", || Value::String(String::new())).with_concat(
                |chunks| {
                    let mut out = String::new();
                    for chunk in chunks {
                        match chunk {
                            Value::String(s) => out.push_str(&s),
                            other => {
                                return Err(RegistryError::OpFailed {
                                    schema: SchemaId::string(),
                                    message: format!("expected string chunk, got {other}"),
                                })
                            }
                        }
                    }
                    Ok(Value::String(out))
                },
            ),
        );

        reg.register(
            SchemaId::number(),
            SchemaOps::new("builtin.number", || Value::from(0)),
        );

        reg.register(SchemaId::json(), SchemaOps::new("builtin.json", || Value::Null));

        reg.register(
            SchemaId::message(),
            SchemaOps::new("builtin.message", || Message::default().to_value()).with_concat(
                |chunks| {
                    let fragments = chunks
                        .iter()
                        .map(Message::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(concat_messages(fragments)?.to_value())
                },
            ),
        );

        reg.register(
            SchemaId::messages(),
            SchemaOps::new("builtin.messages", || Value::Array(Vec::new())).with_concat(
                |chunks| {
                    let mut out = Vec::new();
                    for chunk in chunks {
                        match chunk {
                            Value::Array(items) => out.extend(items),
                            other => out.push(other),
                        }
                    }
                    Ok(Value::Array(out))
                },
            ),
        );

        reg
    }

    /// Register operations for a schema id.
    ///
    /// Idempotent for an identical `(id, tag)` pair.
    ///
    /// # Panics
    ///
    /// Panics when the id is already registered under a different tag:
    /// two subsystems disagreeing about a schema's semantics is a
    /// programmer error that must not be papered over at runtime.
    pub fn register(&self, id: SchemaId, ops: SchemaOps) {
        let mut table = self.ops.write();
        if let Some(existing) = table.get(&id) {
            assert!(
                existing.tag == ops.tag,
                "type registry collision for schema `{id}`: `{}` already registered, refusing `{}`",
                existing.tag,
                ops.tag,
            );
            return;
        }
        table.insert(id, ops);
    }

    /// Whether a concatenator is registered for `id`.
    #[must_use]
    pub fn has_concat(&self, id: &SchemaId) -> bool {
        self.ops
            .read()
            .get(id)
            .is_some_and(|ops| ops.concat.is_some())
    }

    /// Zero value for `id`; `Value::Null` for unregistered schemas.
    pub fn zero(&self, id: &SchemaId) -> Result<Value, RegistryError> {
        Ok(self
            .ops
            .read()
            .get(id)
            .map(|ops| (ops.zero)())
            .unwrap_or(Value::Null))
    }

    /// Reduce `chunks` with the concatenator registered for `id`.
    pub fn concat(&self, id: &SchemaId, chunks: Vec<Value>) -> Result<Value, RegistryError> {
        let concat = self
            .ops
            .read()
            .get(id)
            .and_then(|ops| ops.concat.clone())
            .ok_or_else(|| RegistryError::MissingConcatenator { schema: id.clone() })?;
        concat(chunks)
    }

    /// Merge named slots with the field-merger registered for `id`, or the
    /// default JSON-object assembly when none is registered.
    pub fn merge_fields(
        &self,
        id: &SchemaId,
        slots: Vec<(String, Value)>,
    ) -> Result<Value, RegistryError> {
        let merge = self.ops.read().get(id).and_then(|ops| ops.merge_fields.clone());
        match merge {
            Some(merge) => merge(slots),
            None => {
                let mut obj = serde_json::Map::new();
                for (key, value) in slots {
                    obj.insert(key, value);
                }
                Ok(Value::Object(obj))
            }
        }
    }
}

/// The process-wide [`TypeRegistry`], initialized with built-ins on first
/// access.
pub fn registry() -> &'static TypeRegistry {
    static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(TypeRegistry::with_builtins)
}
