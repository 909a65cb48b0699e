use serde_json::Value;

use crate::schema::{registry, SchemaId};

use super::reader::StreamReader;
use super::StreamError;

/// Drain `reader` and reduce it to a single eager value using the
/// concatenator registered for `schema`.
///
/// - an empty stream yields the schema's zero value,
/// - a single chunk is returned untouched (no concatenator required),
/// - an in-band error is returned as-is and partial data is discarded.
pub async fn concat_values(
    reader: StreamReader<Value>,
    schema: &SchemaId,
) -> Result<Value, StreamError> {
    let mut chunks = reader.collect_all().await?;
    match chunks.len() {
        0 => registry()
            .zero(schema)
            .map_err(|err| StreamError::failed(err.to_string())),
        1 => Ok(chunks.remove(0)),
        _ => registry()
            .concat(schema, chunks)
            .map_err(|err| StreamError::failed(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn concatenates_string_chunks() {
        let reader = StreamReader::from_vec(vec![json!("a"), json!("b"), json!("c")]);
        let out = concat_values(reader, &SchemaId::string()).await.unwrap();
        assert_eq!(out, json!("abc"));
    }

    #[tokio::test]
    async fn empty_stream_yields_zero_value() {
        let reader = StreamReader::from_vec(Vec::new());
        let out = concat_values(reader, &SchemaId::string()).await.unwrap();
        assert_eq!(out, json!(""));
    }

    #[tokio::test]
    async fn single_chunk_needs_no_concatenator() {
        // `json` has no registered concatenator, but one chunk passes through.
        let reader = StreamReader::of(json!({"k": 1}));
        let out = concat_values(reader, &SchemaId::json()).await.unwrap();
        assert_eq!(out, json!({"k": 1}));
    }

    #[tokio::test]
    async fn source_error_discards_partial_data() {
        let reader = StreamReader::from_vec(vec![json!("a"), json!("b")])
            .map(|v| if v == json!("b") { Err(StreamError::Cancelled) } else { Ok(v) });
        let err = concat_values(reader, &SchemaId::string()).await.unwrap_err();
        assert_eq!(err, StreamError::Cancelled);
    }
}
