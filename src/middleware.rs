use std::sync::Arc;

use async_trait::async_trait;

use crate::metadata::MetaData;
use crate::proxy::MeshError;

/// A step in the request chain. Terminal handlers perform the backend call;
/// everything else wraps the next handler.
#[async_trait]
pub trait Handle: Send + Sync {
	async fn handle(&self, data: &mut MetaData) -> Result<(), MeshError>;
}

pub type Handler = Arc<dyn Handle>;

/// A stoppable middleware. `wrap` builds the chain link; `stop` releases any
/// background resources (tickers) at shutdown.
pub trait Feature: Send + Sync {
	fn wrap(&self, next: Handler) -> Handler;
	fn stop(&self) {}
}

/// Composes the chain right-to-left so that registration order matches
/// execution order. Must be called once, before serving; the returned
/// handler is shared by every request task.
pub fn chain(features: &[Arc<dyn Feature>], terminal: Handler) -> Handler {
	features
		.iter()
		.rev()
		.fold(terminal, |next, feature| feature.wrap(next))
}

/// Terminal that stops the chain without touching the backend; the RPC
/// ingress proxies after the chain has resolved the route.
pub struct NoopTerminal;

#[async_trait]
impl Handle for NoopTerminal {
	async fn handle(&self, _data: &mut MetaData) -> Result<(), MeshError> {
		Ok(())
	}
}
