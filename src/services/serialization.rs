//! Serialization bundle: the `Serializer` contract plus a JSON
//! implementation backed by serde_json.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dependency::DependencyRegister;
use crate::provides;
use crate::service::{AdvancedService, Properties, ServiceContext};
use crate::types::Result;

/// Byte-level serializer contract.
///
/// Typed callers go through [`serialize`]/[`deserialize`], which bridge via
/// `serde_json::Value` so the contract stays object-safe.
pub trait Serializer: 'static {
    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn deserialize_value(&self, data: &[u8]) -> Option<serde_json::Value>;
}

/// Serialize a typed value through an erased serializer.
pub fn serialize<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    serializer.serialize_value(&value)
}

/// Deserialize a typed value through an erased serializer. Malformed input
/// yields `None`.
pub fn deserialize<T: DeserializeOwned>(serializer: &dyn Serializer, data: &[u8]) -> Option<T> {
    let value = serializer.deserialize_value(data)?;
    serde_json::from_value(value).ok()
}

/// JSON serializer service.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize_value(&self, data: &[u8]) -> Option<serde_json::Value> {
        serde_json::from_slice(data).ok()
    }
}

impl AdvancedService for JsonSerializer {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        _props: &Properties,
        _ctx: ServiceContext,
    ) -> Self {
        JsonSerializer
    }
}

provides!(JsonSerializer: dyn Serializer);
