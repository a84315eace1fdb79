//! Discovery context and client factory
//!
//! [`Discovery`] is constructed once per process with a connector and the
//! loaded configuration, then handed to whatever needs to register or resolve
//! services. [`ClientFactory`] maps service names to client constructors so
//! callers get a typed client wired to a live balancer.

use crate::{
    backend::Connector,
    balancer::WeightedBalancer,
    config::DiscoveryConfig,
    error::{Error, Result},
    models::{AddressEntry, ServiceDescriptor},
    registrar::{Registrar, RegistrarOptions},
    resolver::{Resolver, ResolverOptions},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared entry point for registration and resolution
#[derive(Clone)]
pub struct Discovery {
    connector: Arc<dyn Connector>,
    config: Arc<DiscoveryConfig>,
}

impl Discovery {
    /// Create a context from a connector and a validated configuration
    pub fn new(connector: Arc<dyn Connector>, config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connector,
            config: Arc::new(config),
        })
    }

    /// Loaded configuration
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Register `descriptor` using the configured endpoints and timeouts
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<Registrar> {
        let registrar = Registrar::new(
            self.connector.clone(),
            RegistrarOptions::from_config(&self.config),
        );
        registrar
            .register(
                descriptor,
                &self.config.coordination.addrs,
                self.config.coordination.dial_duration(),
            )
            .await?;
        Ok(registrar)
    }

    /// Register the instance described in the configuration, if any
    pub async fn register_configured(&self) -> Result<Option<Registrar>> {
        match &self.config.register {
            Some(descriptor) => Ok(Some(self.register(descriptor.clone()).await?)),
            None => Ok(None),
        }
    }

    /// Start resolving a configured domain
    pub async fn resolve(&self, domain: &str) -> Result<ResolvedService> {
        let domain_config = self.config.domain(domain)?;
        let balancer = Arc::new(WeightedBalancer::new(domain_config.load_balance));
        let resolver = Resolver::build(
            domain_config.key_prefix(),
            self.connector.clone(),
            &self.config.coordination.addrs,
            self.config.coordination.dial_duration(),
            ResolverOptions::from_config(&self.config),
            balancer.clone(),
        )
        .await?;

        info!("Resolving domain '{}' at {}", domain, resolver.key_prefix());
        Ok(ResolvedService {
            domain: domain.to_string(),
            resolver,
            balancer,
        })
    }
}

/// A resolver together with the balancer it feeds
pub struct ResolvedService {
    domain: String,
    resolver: Resolver,
    balancer: Arc<WeightedBalancer>,
}

impl ResolvedService {
    /// Domain name this service was resolved from
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Next address to call
    pub fn pick(&self) -> Option<AddressEntry> {
        self.balancer.pick()
    }

    /// Addresses currently known to the balancer
    pub fn addresses(&self) -> Vec<AddressEntry> {
        self.balancer.addresses()
    }

    /// Balancer shared with clients
    pub fn balancer(&self) -> Arc<WeightedBalancer> {
        self.balancer.clone()
    }

    /// Underlying resolver
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Stop resolving
    pub async fn close(&self) {
        self.resolver.close().await;
    }
}

type Constructor<C> = Box<dyn Fn(Arc<WeightedBalancer>) -> C + Send + Sync>;

/// Client constructors keyed by domain name
pub struct ClientFactory<C> {
    constructors: HashMap<String, Constructor<C>>,
}

/// A typed client and the resolution feeding it
pub struct BoundClient<C> {
    /// Client built by the registered constructor
    pub client: C,
    /// Resolution backing the client
    pub service: ResolvedService,
}

impl<C> ClientFactory<C> {
    /// Create an empty factory
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register the constructor used for `domain`
    pub fn register<F>(&mut self, domain: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(Arc<WeightedBalancer>) -> C + Send + Sync + 'static,
    {
        self.constructors.insert(domain.into(), Box::new(constructor));
        self
    }

    /// Resolve `domain` and build its client
    pub async fn build(&self, discovery: &Discovery, domain: &str) -> Result<BoundClient<C>> {
        let constructor = self
            .constructors
            .get(domain)
            .ok_or_else(|| Error::Config(format!("no client registered for '{}'", domain)))?;
        let service = discovery.resolve(domain).await?;
        let client = constructor(service.balancer());
        Ok(BoundClient { client, service })
    }
}

impl<C> Default for ClientFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCoordinator;
    use crate::config::DomainConfig;
    use std::time::Duration;

    fn config() -> DiscoveryConfig {
        let mut config = DiscoveryConfig::default();
        config.coordination.addrs = vec!["memory://local".to_string()];
        config.register = Some(
            ServiceDescriptor::new("user", "10.0.0.1:9000", 10, 10).with_version("v1"),
        );
        config.domains.insert(
            "user".to_string(),
            DomainConfig {
                name: "user/v1".to_string(),
                load_balance: true,
            },
        );
        config
    }

    struct UserClient {
        balancer: Arc<WeightedBalancer>,
    }

    impl UserClient {
        fn target(&self) -> Option<String> {
            self.balancer.pick().map(|entry| entry.address)
        }
    }

    #[smol_potat::test]
    async fn test_register_and_resolve_through_context() {
        let cluster = MemoryCoordinator::new();
        let discovery = Discovery::new(Arc::new(cluster.connector()), config()).unwrap();

        let registrar = discovery.register_configured().await.unwrap().unwrap();
        let service = discovery.resolve("user").await.unwrap();
        assert_eq!(service.domain(), "user");
        assert_eq!(service.pick().unwrap().address, "10.0.0.1:9000");

        registrar.close().await.unwrap();
        smol::Timer::after(Duration::from_millis(50)).await;
        assert!(service.pick().is_none());
        service.close().await;
    }

    #[smol_potat::test]
    async fn test_unknown_domain_is_config_error() {
        let cluster = MemoryCoordinator::new();
        let discovery = Discovery::new(Arc::new(cluster.connector()), config()).unwrap();
        assert!(matches!(discovery.resolve("order").await, Err(Error::Config(_))));
    }

    #[smol_potat::test]
    async fn test_factory_builds_registered_clients() {
        let cluster = MemoryCoordinator::new();
        let discovery = Discovery::new(Arc::new(cluster.connector()), config()).unwrap();
        let registrar = discovery.register_configured().await.unwrap().unwrap();

        let mut factory = ClientFactory::new();
        factory.register("user", |balancer| UserClient { balancer });

        let bound = factory.build(&discovery, "user").await.unwrap();
        assert_eq!(bound.client.target().as_deref(), Some("10.0.0.1:9000"));
        assert!(matches!(
            factory.build(&discovery, "order").await,
            Err(Error::Config(_))
        ));

        bound.service.close().await;
        registrar.close().await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cluster = MemoryCoordinator::new();
        let mut config = config();
        config.coordination.addrs.clear();
        assert!(Discovery::new(Arc::new(cluster.connector()), config).is_err());
    }
}
