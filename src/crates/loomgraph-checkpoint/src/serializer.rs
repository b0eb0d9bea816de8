//! Serialization protocol for checkpoint payloads.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Pluggable serialization strategy for checkpoint storage backends.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes.
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes.
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// JSON serializer (default; human-inspectable files).
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Compact binary serializer using bincode.
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        step: i64,
    }

    #[test]
    fn json_round_trip() {
        let s = JsonSerializer::new();
        let value = Sample { name: "cp".into(), step: 3 };
        let restored: Sample = s.loads(&s.dumps(&value).unwrap()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn bincode_round_trip() {
        let s = BincodeSerializer::new();
        let value = Sample { name: "cp".into(), step: 3 };
        let restored: Sample = s.loads(&s.dumps(&value).unwrap()).unwrap();
        assert_eq!(restored, value);
    }
}
