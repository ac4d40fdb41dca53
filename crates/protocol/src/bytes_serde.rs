//! Byte fields travel as standard base64 strings inside the JSON envelope.

use base64::{engine::general_purpose, Engine as _};
use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(text) => general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(D::Error::custom),
        None => Ok(Vec::new()),
    }
}

/// `Vec<Vec<u8>>` as an array of base64 strings.
pub mod list {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&general_purpose::STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|text| {
                general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

/// `HashMap<String, Vec<u8>>` as an object of base64 strings.
pub mod map {
    use super::*;
    use serde::ser::SerializeMap;
    use std::collections::HashMap;

    pub fn serialize<S>(entries: &HashMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, &general_purpose::STANDARD.encode(value))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, text)| {
                general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map(|bytes| (key, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
