//! Protocol registry
//!
//! Two independent namespaces (inbound, outbound), each mapping a protocol
//! name to a config constructor and a handler factory. Entries are
//! write-once; lookups of unknown names return `None`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::handler::{
    InboundConnectionHandler, InboundContext, InboundProtocol, OutboundConnectionHandler,
    OutboundContext, OutboundProtocol,
};
use crate::error::{GatewayError, Result};

/// Namespace of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigType {
    Inbound,
    Outbound,
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigType::Inbound => write!(f, "inbound"),
            ConfigType::Outbound => write!(f, "outbound"),
        }
    }
}

/// Type-erased protocol configuration
pub type AnyConfig = Box<dyn Any + Send + Sync>;

/// Builds a protocol configuration from its raw settings
pub type ConfigCtor = Arc<dyn Fn(&toml::Value) -> Result<AnyConfig> + Send + Sync>;

/// Builds an inbound handler from its configuration
pub type InboundFactory = Arc<
    dyn Fn(AnyConfig, &InboundContext) -> Result<Arc<dyn InboundConnectionHandler>> + Send + Sync,
>;

/// Builds an outbound handler from its configuration
pub type OutboundFactory = Arc<
    dyn Fn(AnyConfig, &OutboundContext) -> Result<Arc<dyn OutboundConnectionHandler>> + Send + Sync,
>;

fn insert_once<V>(
    map: &DashMap<String, V>,
    namespace: ConfigType,
    name: &str,
    value: V,
) -> Result<()> {
    match map.entry(name.to_string()) {
        Entry::Occupied(_) => Err(GatewayError::DuplicateRegistration {
            namespace,
            name: name.to_string(),
        }),
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

fn typed_config<T>(settings: &toml::Value) -> Result<AnyConfig>
where
    T: serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let config: T = settings.clone().try_into()?;
    Ok(Box::new(config))
}

fn downcast_config<T: 'static>(config: AnyConfig, name: &str) -> Result<T> {
    config
        .downcast::<T>()
        .map(|c| *c)
        .map_err(|_| GatewayError::Config(format!("{}: configuration type mismatch", name)))
}

/// Name-keyed protocol constructors, created at startup and shared read-only
#[derive(Default)]
pub struct Registry {
    inbound_configs: DashMap<String, ConfigCtor>,
    outbound_configs: DashMap<String, ConfigCtor>,
    inbound_handlers: DashMap<String, InboundFactory>,
    outbound_handlers: DashMap<String, OutboundFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        crate::proxy::register_builtins(&registry)?;
        Ok(registry)
    }

    fn configs(&self, namespace: ConfigType) -> &DashMap<String, ConfigCtor> {
        match namespace {
            ConfigType::Inbound => &self.inbound_configs,
            ConfigType::Outbound => &self.outbound_configs,
        }
    }

    pub fn register_inbound_config<F>(&self, name: &str, ctor: F) -> Result<()>
    where
        F: Fn(&toml::Value) -> Result<AnyConfig> + Send + Sync + 'static,
    {
        insert_once(&self.inbound_configs, ConfigType::Inbound, name, Arc::new(ctor))
    }

    pub fn register_outbound_config<F>(&self, name: &str, ctor: F) -> Result<()>
    where
        F: Fn(&toml::Value) -> Result<AnyConfig> + Send + Sync + 'static,
    {
        insert_once(&self.outbound_configs, ConfigType::Outbound, name, Arc::new(ctor))
    }

    pub fn register_inbound_handler<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(AnyConfig, &InboundContext) -> Result<Arc<dyn InboundConnectionHandler>>
            + Send
            + Sync
            + 'static,
    {
        insert_once(&self.inbound_handlers, ConfigType::Inbound, name, Arc::new(factory))
    }

    pub fn register_outbound_handler<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(AnyConfig, &OutboundContext) -> Result<Arc<dyn OutboundConnectionHandler>>
            + Send
            + Sync
            + 'static,
    {
        insert_once(&self.outbound_handlers, ConfigType::Outbound, name, Arc::new(factory))
    }

    /// Register an inbound protocol's config and handler under `P::NAME`
    pub fn register_inbound<P: InboundProtocol>(&self) -> Result<()> {
        if self.inbound_configs.contains_key(P::NAME)
            || self.inbound_handlers.contains_key(P::NAME)
        {
            return Err(GatewayError::DuplicateRegistration {
                namespace: ConfigType::Inbound,
                name: P::NAME.to_string(),
            });
        }
        self.register_inbound_config(P::NAME, typed_config::<P::Config>)?;
        self.register_inbound_handler(P::NAME, |config, ctx| {
            P::create(downcast_config::<P::Config>(config, P::NAME)?, ctx)
        })
    }

    /// Register an outbound protocol's config and handler under `P::NAME`
    pub fn register_outbound<P: OutboundProtocol>(&self) -> Result<()> {
        if self.outbound_configs.contains_key(P::NAME)
            || self.outbound_handlers.contains_key(P::NAME)
        {
            return Err(GatewayError::DuplicateRegistration {
                namespace: ConfigType::Outbound,
                name: P::NAME.to_string(),
            });
        }
        self.register_outbound_config(P::NAME, typed_config::<P::Config>)?;
        self.register_outbound_handler(P::NAME, |config, ctx| {
            P::create(downcast_config::<P::Config>(config, P::NAME)?, ctx)
        })
    }

    /// Build the configuration registered as `name` in `namespace`
    ///
    /// `None` means the protocol is not registered there.
    pub fn create_config(
        &self,
        name: &str,
        namespace: ConfigType,
        settings: &toml::Value,
    ) -> Option<Result<AnyConfig>> {
        // Clone the ctor out so the shard lock is not held while it runs
        let ctor = self.configs(namespace).get(name).map(|c| Arc::clone(c.value()))?;
        Some(ctor(settings))
    }

    pub fn create_inbound_handler(
        &self,
        name: &str,
        config: AnyConfig,
        ctx: &InboundContext,
    ) -> Option<Result<Arc<dyn InboundConnectionHandler>>> {
        let factory = self
            .inbound_handlers
            .get(name)
            .map(|f| Arc::clone(f.value()))?;
        Some(factory(config, ctx))
    }

    pub fn create_outbound_handler(
        &self,
        name: &str,
        config: AnyConfig,
        ctx: &OutboundContext,
    ) -> Option<Result<Arc<dyn OutboundConnectionHandler>>> {
        let factory = self
            .outbound_handlers
            .get(name)
            .map(|f| Arc::clone(f.value()))?;
        Some(factory(config, ctx))
    }

    /// Sorted names with a config constructor in `namespace`
    pub fn protocols(&self, namespace: ConfigType) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs(namespace)
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("inbound", &self.protocols(ConfigType::Inbound))
            .field("outbound", &self.protocols(ConfigType::Outbound))
            .finish()
    }
}
