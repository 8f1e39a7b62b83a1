use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Code, Status};

use crate::config::Config;
use crate::metadata::MetaData;
use crate::pool::Pool;
use crate::registry::MessageRegistry;
use crate::route::RouteState;

pub mod gateway;
pub mod grpcproxy;
pub mod httpproxy;

pub const SYSTEM_ERROR: &str = "system error";

/// Best-effort text out of a recovered panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		SYSTEM_ERROR.to_string()
	}
}

#[derive(thiserror::Error, Debug)]
pub enum MeshError {
	#[error("{0} is wrong url")]
	MalformedPath(String),
	#[error("wrong payload pattern")]
	MalformedPayload,
	#[error("no router here")]
	NoRoute,
	#[error("no host here")]
	NoHost,
	#[error("the proto message {0} is not registered")]
	NoMessage(String),
	#[error("the token bucket is empty")]
	BucketEmpty,
	#[error("the IP is limited")]
	IpLimited,
	#[error("{0}")]
	Hook(String),
	#[error("no connection pool for {0}")]
	NoPool(String),
	#[error("connection pool for {0} is exhausted")]
	PoolExhausted(String),
	#[error("connection pool for {0} is closed")]
	PoolClosed(String),
	#[error("{target} is unreachable: {reason}")]
	Unreachable { target: String, reason: String },
	#[error("upstream call failed: {0}")]
	Upstream(Status),
	#[error("codec failure: {0}")]
	Codec(String),
}

impl MeshError {
	/// User-input and policy denials ride in the response envelope so every
	/// filter observes them the same way; everything else is a transport
	/// failure. This is the single classification point.
	pub fn is_in_band(&self) -> bool {
		matches!(
			self,
			MeshError::MalformedPath(_)
				| MeshError::MalformedPayload
				| MeshError::NoRoute
				| MeshError::NoHost
				| MeshError::NoMessage(_)
				| MeshError::BucketEmpty
				| MeshError::IpLimited
				| MeshError::Hook(_)
		)
	}

	/// Converts an in-band kind into the request's error result; transport
	/// kinds pass through for the ingress to surface.
	pub fn absorb(self, data: &mut MetaData) -> Result<(), MeshError> {
		if self.is_in_band() {
			data.set_error(self.to_string());
			Ok(())
		} else {
			Err(self)
		}
	}

	pub fn to_status(&self) -> Status {
		match self {
			e if e.is_in_band() => Status::resource_exhausted(e.to_string()),
			MeshError::Upstream(status) => status.clone(),
			MeshError::NoPool(_)
			| MeshError::PoolExhausted(_)
			| MeshError::PoolClosed(_)
			| MeshError::Unreachable { .. } => Status::new(Code::Unavailable, self.to_string()),
			_ => Status::internal(self.to_string()),
		}
	}
}

/// The fabric both ingresses share: configuration, the swappable route
/// state, the message registry and one connection pool per backend address.
pub struct MeshInputs {
	pub cfg: Arc<Config>,
	pub routes: RouteState,
	pub registry: Arc<MessageRegistry>,
	pub pools: HashMap<String, Pool>,
}

impl MeshInputs {
	pub fn pool(&self, target: &str) -> Result<&Pool, MeshError> {
		self
			.pools
			.get(target)
			.ok_or_else(|| MeshError::NoPool(target.to_string()))
	}
}
