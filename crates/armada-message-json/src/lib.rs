use armada_core::error::CodecError;
use armada_core::traits::Codec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Compact JSON codec. One encoded message is one JSON object with no
/// embedded newlines, so frames compose directly with the line-delimited
/// transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<M> Codec<M> for JsonCodec
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, msg: &M) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<M, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }
}
