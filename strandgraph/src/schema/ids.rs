use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a declared value type.
///
/// Two edge endpoints are compatible iff their schema ids are equal or the
/// edge carries an explicit coercion. Ids are plain strings so user crates
/// can introduce their own; the constructors below cover the built-ins the
/// engine itself knows about.
///
/// # Examples
///
/// ```
/// use strandgraph::schema::SchemaId;
///
/// let s = SchemaId::string();
/// assert_eq!(s.as_str(), "string");
/// assert_eq!(SchemaId::of("weather.report").as_str(), "weather.report");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaId(String);

impl SchemaId {
    /// A user-defined schema id.
    #[must_use]
    pub fn of(id: impl Into<String>) -> Self {
        SchemaId(id.into())
    }

    /// UTF-8 text. Concatenator: string join.
    #[must_use]
    pub fn string() -> Self {
        SchemaId("string".into())
    }

    /// JSON number. No built-in concatenator.
    #[must_use]
    pub fn number() -> Self {
        SchemaId("number".into())
    }

    /// Arbitrary JSON. No built-in concatenator; single-chunk streams and
    /// map-merged fan-ins still work without one.
    #[must_use]
    pub fn json() -> Self {
        SchemaId("json".into())
    }

    /// A single chat [`Message`](crate::schema::Message). Concatenator:
    /// content join plus tool-call merge by index.
    #[must_use]
    pub fn message() -> Self {
        SchemaId("message".into())
    }

    /// A list of chat messages. Concatenator: list append.
    #[must_use]
    pub fn messages() -> Self {
        SchemaId("messages".into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaId {
    fn from(id: &str) -> Self {
        SchemaId(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        assert_eq!(SchemaId::of("string"), SchemaId::string());
        assert_ne!(SchemaId::string(), SchemaId::number());
    }

    #[test]
    fn display_matches_raw_id() {
        assert_eq!(SchemaId::message().to_string(), "message");
    }
}
