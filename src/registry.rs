use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::proxy::MeshError;
use crate::route::RouteTable;

/// A schema message usable without knowing its concrete type: cloneable from
/// a zero-value prototype, bridged to JSON on the ingress side and to the
/// wire encoding on the backend side.
pub trait DynMessage: Send + Sync {
	fn clone_zero(&self) -> Box<dyn DynMessage>;
	fn merge_json(&mut self, payload: &Value) -> Result<(), MeshError>;
	fn to_json(&self) -> Result<Value, MeshError>;
	fn encode_frame(&self) -> Bytes;
	fn merge_frame(&mut self, frame: Bytes) -> Result<(), MeshError>;
}

impl<M> DynMessage for M
where
	M: Message + Serialize + DeserializeOwned + Default + 'static,
{
	fn clone_zero(&self) -> Box<dyn DynMessage> {
		Box::new(M::default())
	}

	fn merge_json(&mut self, payload: &Value) -> Result<(), MeshError> {
		*self = serde_json::from_value(payload.clone()).map_err(|_| MeshError::MalformedPayload)?;
		Ok(())
	}

	fn to_json(&self) -> Result<Value, MeshError> {
		serde_json::to_value(self).map_err(|e| MeshError::Codec(e.to_string()))
	}

	fn encode_frame(&self) -> Bytes {
		Bytes::from(self.encode_to_vec())
	}

	fn merge_frame(&mut self, frame: Bytes) -> Result<(), MeshError> {
		self.merge(frame).map_err(|e| MeshError::Codec(e.to_string()))
	}
}

/// Fully-qualified message name -> zero-value prototype. Populated once at
/// startup by the embedding program's generated types; read-only afterwards.
#[derive(Default)]
pub struct MessageRegistry {
	prototypes: HashMap<String, Box<dyn DynMessage>>,
}

impl MessageRegistry {
	pub fn register<M>(&mut self, name: impl Into<String>)
	where
		M: Message + Serialize + DeserializeOwned + Default + 'static,
	{
		self.prototypes.insert(name.into(), Box::new(M::default()));
	}

	pub fn contains(&self, name: &str) -> bool {
		self.prototypes.contains_key(name)
	}

	pub fn is_empty(&self) -> bool {
		self.prototypes.is_empty()
	}

	/// Produces a fresh zero-value instance of the named message.
	pub fn materialize(&self, name: &str) -> Result<Box<dyn DynMessage>, MeshError> {
		self
			.prototypes
			.get(name)
			.map(|p| p.clone_zero())
			.ok_or_else(|| MeshError::NoMessage(name.to_string()))
	}

	/// Checks that every message name the route table references resolves
	/// here. Run at startup when the HTTP ingress is enabled; a miss means
	/// the transcoder cannot serve that route at all.
	pub fn validate(&self, table: &RouteTable) -> Result<(), MeshError> {
		for desc in table.routes.values() {
			for name in [&desc.request_message, &desc.response_message] {
				if !name.is_empty() && !self.contains(name) {
					return Err(MeshError::NoMessage(name.clone()));
				}
			}
		}
		Ok(())
	}
}
