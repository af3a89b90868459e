use std::iter::FromIterator;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::IVec;
use uuid::Uuid;

/// The separator between the pipeline & connector components of a checkpoint key.
const KEY_SEPARATOR: u8 = b'/';

/// Encode the prefix under which all checkpoints of the given pipeline are stored.
pub fn checkpoint_prefix(pipeline: &Uuid) -> IVec {
    ivec_from_iter(pipeline.as_hyphenated().to_string().into_bytes().into_iter().chain([KEY_SEPARATOR]))
}

/// Encode the key of a connector checkpoint, `{pipeline}/{connector}`.
///
/// Connector names may not contain the separator, so keys of distinct connectors never collide.
pub fn checkpoint_key(pipeline: &Uuid, connector: &str) -> IVec {
    ivec_from_iter(checkpoint_prefix(pipeline).iter().copied().chain(connector.as_bytes().iter().copied()))
}

/// Decode the connector name from the given checkpoint key.
pub fn decode_checkpoint_connector(key: &[u8]) -> Result<String> {
    let idx = key
        .iter()
        .position(|byte| *byte == KEY_SEPARATOR)
        .context("checkpoint key is missing its separator")?;
    String::from_utf8(key[idx + 1..].to_vec()).context("checkpoint key contains an invalid connector name")
}

/// Encode the given model as JSON bytes.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// Encode the given bytes iterator as an IVec.
pub fn ivec_from_iter<T: IntoIterator<Item = u8>>(data: T) -> IVec {
    IVec::from_iter(data)
}

/// Encode the key of a pipeline record.
pub fn pipeline_key(pipeline: &Uuid) -> IVec {
    ivec_from_iter(pipeline.as_hyphenated().to_string().into_bytes())
}
