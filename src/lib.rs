pub mod balance;
pub mod codec;
pub mod config;
pub mod limit;
pub mod metadata;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod route;
pub mod signal;
pub mod telemetry;

pub use config::Config;
pub use metadata::MetaData;
pub use proxy::MeshError;
pub use proxy::gateway::Gateway;
pub use registry::MessageRegistry;
