//! CBOR helpers for envelope framing.

use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| TransportError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data)
        .map_err(|e| TransportError::Deserialization(format!("CBOR deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_data_returns_error() {
        let result: Result<Vec<u8>, _> = from_slice(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
        let result: Result<Vec<u8>, _> = from_slice(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let bytes = to_vec(&vec![1u8, 2, 3]).expect("serialize");
        let restored: Vec<u8> = from_slice(&bytes).expect("deserialize");
        assert_eq!(restored, vec![1, 2, 3]);
    }
}
