use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Versioned wrapper persisted for every stored value.
///
/// Serialized as `{ "version": "v<N>", "updatedAt": "<RFC 3339>", "data": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEnvelope<T> {
    #[serde(with = "version_tag")]
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub data: T,
}

impl<T> StorageEnvelope<T> {
    pub fn new(version: u32, data: T) -> Self {
        Self {
            version,
            updated_at: Utc::now(),
            data,
        }
    }

    /// Envelope written on reset or first save.
    pub fn initial(data: T) -> Self {
        Self::new(0, data)
    }

    /// Successor envelope carrying `data` one version later.
    pub fn next(&self, data: T) -> Self {
        Self::new(self.version.saturating_add(1), data)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StorageEnvelope<U> {
        StorageEnvelope {
            version: self.version,
            updated_at: self.updated_at,
            data: f(self.data),
        }
    }
}

mod version_tag {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Tag(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(version: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("v{version}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u32::try_from(n).map_err(D::Error::custom),
            Raw::Tag(tag) => {
                let digits = tag.strip_prefix('v').unwrap_or(&tag);
                digits
                    .parse::<u32>()
                    .map_err(|_| D::Error::custom(format!("invalid envelope version `{tag}`")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn serializes_with_tagged_version_and_camel_case() {
        let envelope = StorageEnvelope::new(1, json!({ "zoom": 4 }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["version"], json!("v1"));
        assert_eq!(value["data"], json!({ "zoom": 4 }));
        assert!(value["updatedAt"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn accepts_legacy_and_numeric_versions() {
        let tagged: StorageEnvelope<Value> = serde_json::from_str(
            r#"{"version":"v7","updatedAt":"2024-05-01T10:00:00.000Z","data":{}}"#,
        )
        .unwrap();
        assert_eq!(tagged.version, 7);

        let numeric: StorageEnvelope<Value> = serde_json::from_str(
            r#"{"version":3,"updatedAt":"2024-05-01T10:00:00Z","data":null}"#,
        )
        .unwrap();
        assert_eq!(numeric.version, 3);
    }

    #[test]
    fn rejects_garbage_version() {
        let parsed: Result<StorageEnvelope<Value>, _> = serde_json::from_str(
            r#"{"version":"latest","updatedAt":"2024-05-01T10:00:00Z","data":{}}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn next_bumps_version() {
        let first = StorageEnvelope::initial("a");
        let second = first.next("b");
        assert_eq!(first.version, 0);
        assert_eq!(second.version, 1);
        assert_eq!(second.data, "b");
    }
}
