use serde_json::Value;

use crate::graph::{MergePlan, NodeKey};
use crate::schema::{registry, SchemaId};

use super::ExecError;

/// One predecessor's contribution to a node's input.
pub(crate) struct Delivery {
    pub(crate) pred: NodeKey,
    /// Slot label: the predecessor's `output_key`, defaulting to its key.
    pub(crate) slot: Option<String>,
    pub(crate) value: Value,
}

/// Assemble a node's input from its buffered predecessor deliveries.
///
/// `deliveries` must be ordered by the plan's predecessor order, not by
/// arrival order, which keeps map- and list-merges deterministic under
/// concurrent completion.
pub(crate) fn assemble_input(
    key: &NodeKey,
    plan: &MergePlan,
    deliveries: Vec<Delivery>,
    input_key: Option<&str>,
    input_schema: &SchemaId,
) -> Result<Value, ExecError> {
    match plan {
        MergePlan::Single => {
            let Some(delivery) = deliveries.into_iter().next() else {
                return Ok(Value::Null);
            };
            match input_key {
                None => Ok(delivery.value),
                Some(wanted) => extract_slot(key, wanted, delivery),
            }
        }
        MergePlan::MapBySlot => {
            let slots: Vec<(String, Value)> = deliveries
                .into_iter()
                .map(|d| {
                    let slot = d.slot.unwrap_or_else(|| d.pred.as_str().to_string());
                    (slot, d.value)
                })
                .collect();
            match input_key {
                Some(wanted) => slots
                    .into_iter()
                    .find(|(slot, _)| slot == wanted)
                    .map(|(_, value)| value)
                    .ok_or_else(|| ExecError::MergeFailed {
                        key: key.clone(),
                        message: format!("no predecessor filled input slot `{wanted}`"),
                    }),
                None => registry()
                    .merge_fields(input_schema, slots)
                    .map_err(|err| ExecError::MergeFailed {
                        key: key.clone(),
                        message: err.to_string(),
                    }),
            }
        }
        MergePlan::ListAppend => {
            let values: Vec<Value> = deliveries.into_iter().map(|d| d.value).collect();
            if registry().has_concat(input_schema) {
                registry()
                    .concat(input_schema, values)
                    .map_err(|err| ExecError::MergeFailed {
                        key: key.clone(),
                        message: err.to_string(),
                    })
            } else {
                Ok(Value::Array(values))
            }
        }
        MergePlan::User(merger) => {
            let pairs: Vec<(NodeKey, Value)> =
                deliveries.into_iter().map(|d| (d.pred, d.value)).collect();
            merger(pairs).map_err(|err| ExecError::MergeFailed {
                key: key.clone(),
                message: err.to_string(),
            })
        }
    }
}

fn extract_slot(key: &NodeKey, wanted: &str, delivery: Delivery) -> Result<Value, ExecError> {
    if delivery.slot.as_deref() == Some(wanted) {
        return Ok(delivery.value);
    }
    match delivery.value {
        Value::Object(mut obj) => obj.remove(wanted).ok_or_else(|| ExecError::MergeFailed {
            key: key.clone(),
            message: format!("input slot `{wanted}` missing from merged input map"),
        }),
        _ => Err(ExecError::MergeFailed {
            key: key.clone(),
            message: format!("input slot `{wanted}` requested but input is not a map"),
        }),
    }
}
