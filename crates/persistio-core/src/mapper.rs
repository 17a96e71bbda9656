//! Object to record mapping

use crate::record::Record;
use persistio_common::{Error, Identity, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Converts objects to records and back
pub trait ObjectMapper<E>: Send + Sync {
    fn encode(&self, object: &E) -> Result<Record>;

    fn decode(&self, id: &Identity, record: Record) -> Result<E>;
}

/// Mapper for `serde` types whose JSON form is an object
pub struct JsonMapper<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonMapper<E> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for JsonMapper<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObjectMapper<E> for JsonMapper<E>
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, object: &E) -> Result<Record> {
        let value = serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))?;
        Record::from_json(value)
    }

    fn decode(&self, id: &Identity, record: Record) -> Result<E> {
        serde_json::from_value(record.into_json())
            .map_err(|e| Error::serialization(format!("decoding {id}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Identity,
        text: String,
    }

    #[test]
    fn test_json_mapper_roundtrip() {
        let mapper = JsonMapper::<Note>::new();
        let id = Identity::new("note", "1").unwrap();
        let note = Note {
            id: id.clone(),
            text: "hello".into(),
        };

        let record = mapper.encode(&note).unwrap();
        assert_eq!(record.get("id"), Some(&serde_json::json!("note:1")));
        assert_eq!(mapper.decode(&id, record).unwrap(), note);
    }

    #[test]
    fn test_json_mapper_rejects_non_objects() {
        let mapper = JsonMapper::<u32>::new();
        let err = mapper.encode(&7).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
