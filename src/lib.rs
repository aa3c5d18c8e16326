pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod platform;
pub mod proxy;
pub mod pty;
pub mod registry;
pub mod resolver;
pub mod shutdown;

pub use cache::{connect_cache, AddressCache, MemoryCache, NullCache, RedisCache};
pub use errors::{GatewayError, GatewayResult};
pub use models::{ContainerAddress, SandboxId};
pub use platform::{ContainerPlatform, LxcPlatform};
pub use proxy::{spawn_proxy, Dispatcher, ProxyConfig};
pub use pty::{build_router, BridgeConfig, PtyBridge};
pub use resolver::SandboxResolver;

pub const DEFAULT_PROXY_PORT: u16 = 3000;
pub const DEFAULT_PTY_PORT: u16 = 8081;
pub const DEFAULT_FORWARD_PORT: u16 = 80;

pub const DEFAULT_CACHE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "agent:";
pub const DEFAULT_CONTAINER_PREFIX: &str = "ginto-sandbox-";
pub const DEFAULT_BASE_IMAGE: &str = "ginto-sandbox";
