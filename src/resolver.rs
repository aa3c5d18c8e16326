use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::AddressCache;
use crate::models::{ContainerAddress, SandboxId};
use crate::platform::ContainerPlatform;

/// How a resolution was answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedVia {
    /// Cached address confirmed by the platform.
    Cache,
    /// Cached address was stale; the platform's answer replaced it.
    Refreshed,
    /// Cache miss answered by the platform.
    Platform,
    /// Container was launched for this request.
    Created,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub address: ContainerAddress,
    pub via: ResolvedVia,
}

/// Maps a sandbox id to a live address. The cache is only a hint: every hit
/// is checked against the platform before it is returned.
pub struct SandboxResolver {
    cache: Arc<dyn AddressCache>,
    platform: Arc<dyn ContainerPlatform>,
    settle: Duration,
}

impl SandboxResolver {
    pub fn new(
        cache: Arc<dyn AddressCache>,
        platform: Arc<dyn ContainerPlatform>,
        settle: Duration,
    ) -> Self {
        Self {
            cache,
            platform,
            settle,
        }
    }

    pub fn cache(&self) -> &Arc<dyn AddressCache> {
        &self.cache
    }

    pub fn platform(&self) -> &Arc<dyn ContainerPlatform> {
        &self.platform
    }

    pub async fn resolve(&self, id: &SandboxId, auto_create: bool) -> Option<Resolved> {
        let live = match self.cache.get(id).await {
            Some(cached) => {
                let live = self.platform.address_of(id).await;
                match live {
                    Some(address) if address == cached => {
                        debug!(sandbox = %id, %address, "cache hit verified");
                        return Some(Resolved {
                            address,
                            via: ResolvedVia::Cache,
                        });
                    }
                    Some(address) => {
                        info!(sandbox = %id, stale = %cached, %address, "cached address drifted");
                        self.cache.set(id, address).await;
                        return Some(Resolved {
                            address,
                            via: ResolvedVia::Refreshed,
                        });
                    }
                    None => {
                        info!(sandbox = %id, stale = %cached, "cached sandbox is gone");
                        self.cache.invalidate(id).await;
                        // The platform was just asked; its answer stands in
                        // for the direct query below.
                        None
                    }
                }
            }
            None => self.platform.address_of(id).await,
        };

        if let Some(address) = live {
            self.cache.set(id, address).await;
            return Some(Resolved {
                address,
                via: ResolvedVia::Platform,
            });
        }

        if !auto_create {
            return None;
        }

        self.create(id).await
    }

    async fn create(&self, id: &SandboxId) -> Option<Resolved> {
        match self.platform.launch(id).await {
            Ok(()) => tokio::time::sleep(self.settle).await,
            // A concurrent request may have created it; look once more.
            Err(err) => warn!(sandbox = %id, %err, "container launch failed"),
        }

        let address = self.platform.address_of(id).await?;
        self.cache.set(id, address).await;
        info!(sandbox = %id, %address, "sandbox created");
        Some(Resolved {
            address,
            via: ResolvedVia::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, NullCache};
    use crate::errors::{GatewayError, GatewayResult};
    use crate::models::ContainerListing;
    use crate::platform::ShellCommand;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedPlatform {
        addresses: DashMap<SandboxId, ContainerAddress>,
        /// Address a launched container receives.
        launch_address: Option<ContainerAddress>,
        fail_launch: bool,
        address_queries: AtomicUsize,
        launches: AtomicUsize,
    }

    #[async_trait]
    impl ContainerPlatform for ScriptedPlatform {
        fn prefix(&self) -> &str {
            "test-"
        }

        async fn address_of(&self, id: &SandboxId) -> Option<ContainerAddress> {
            self.address_queries.fetch_add(1, Ordering::SeqCst);
            self.addresses.get(id).map(|a| *a)
        }

        async fn exists(&self, id: &SandboxId) -> bool {
            self.addresses.contains_key(id)
        }

        async fn launch(&self, id: &SandboxId) -> GatewayResult<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch {
                return Err(GatewayError::CommandFailed {
                    command: "launch".into(),
                    message: "already exists".into(),
                });
            }
            if let Some(address) = self.launch_address {
                self.addresses.insert(id.clone(), address);
            }
            Ok(())
        }

        async fn list(&self) -> GatewayResult<Vec<ContainerListing>> {
            Ok(Vec::new())
        }

        fn shell_command(&self, _id: &SandboxId) -> ShellCommand {
            ShellCommand::new("/bin/sh")
        }
    }

    fn id(raw: &str) -> SandboxId {
        SandboxId::parse(raw).unwrap()
    }

    fn addr(last: u8) -> ContainerAddress {
        Ipv4Addr::new(10, 0, 3, last).into()
    }

    fn resolver(
        cache: Arc<dyn AddressCache>,
        platform: Arc<ScriptedPlatform>,
    ) -> SandboxResolver {
        SandboxResolver::new(cache, platform, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn verified_cache_hit_is_returned() {
        let cache = Arc::new(MemoryCache::new());
        let platform = Arc::new(ScriptedPlatform::default());
        platform.addresses.insert(id("alice"), addr(5));
        cache.set(&id("alice"), addr(5)).await;

        let resolved = resolver(cache, platform.clone())
            .resolve(&id("alice"), false)
            .await
            .unwrap();
        assert_eq!(resolved.address, addr(5));
        assert_eq!(resolved.via, ResolvedVia::Cache);
        assert_eq!(platform.address_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drifted_cache_entry_is_replaced() {
        let cache = Arc::new(MemoryCache::new());
        let platform = Arc::new(ScriptedPlatform::default());
        cache.set(&id("x"), addr(5)).await;
        platform.addresses.insert(id("x"), addr(9));

        let resolved = resolver(cache.clone(), platform)
            .resolve(&id("x"), false)
            .await
            .unwrap();
        assert_eq!(resolved.address, addr(9));
        assert_eq!(resolved.via, ResolvedVia::Refreshed);
        assert_eq!(cache.get(&id("x")).await, Some(addr(9)));
    }

    #[tokio::test]
    async fn vanished_container_discards_cache_entry() {
        let cache = Arc::new(MemoryCache::new());
        let platform = Arc::new(ScriptedPlatform::default());
        cache.set(&id("gone"), addr(5)).await;

        let resolved = resolver(cache.clone(), platform.clone())
            .resolve(&id("gone"), false)
            .await;
        assert!(resolved.is_none());
        assert!(cache.is_empty());
        assert_eq!(platform.address_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_is_answered_by_platform_and_cached() {
        let cache = Arc::new(MemoryCache::new());
        let platform = Arc::new(ScriptedPlatform::default());
        platform.addresses.insert(id("bob"), addr(7));

        let resolved = resolver(cache.clone(), platform)
            .resolve(&id("bob"), false)
            .await
            .unwrap();
        assert_eq!(resolved.via, ResolvedVia::Platform);
        assert_eq!(cache.get(&id("bob")).await, Some(addr(7)));
    }

    #[tokio::test]
    async fn not_found_without_auto_create_never_launches() {
        let platform = Arc::new(ScriptedPlatform {
            launch_address: Some(addr(8)),
            ..Default::default()
        });
        let resolver = resolver(Arc::new(NullCache), platform.clone());
        for _ in 0..3 {
            assert!(resolver.resolve(&id("nobody"), false).await.is_none());
        }
        assert_eq!(platform.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_create_launches_and_caches() {
        let cache = Arc::new(MemoryCache::new());
        let platform = Arc::new(ScriptedPlatform {
            launch_address: Some(addr(8)),
            ..Default::default()
        });
        let resolved = resolver(cache.clone(), platform.clone())
            .resolve(&id("new"), true)
            .await
            .unwrap();
        assert_eq!(resolved.via, ResolvedVia::Created);
        assert_eq!(resolved.address, addr(8));
        assert_eq!(platform.launches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&id("new")).await, Some(addr(8)));
    }

    #[tokio::test]
    async fn failed_launch_without_address_is_not_found() {
        let platform = Arc::new(ScriptedPlatform {
            fail_launch: true,
            ..Default::default()
        });
        let resolved = resolver(Arc::new(NullCache), platform.clone())
            .resolve(&id("new"), true)
            .await;
        assert!(resolved.is_none());
        assert_eq!(platform.launches.load(Ordering::SeqCst), 1);
    }
}
