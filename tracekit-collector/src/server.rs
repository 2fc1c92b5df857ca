//! Wiring engines and transports into a running collector.

use crate::config::Config;
use crate::error::Error;
use crate::storage::{self, Storage};
use crate::transport::{self, QueryTransport, StorageTransport};
use futures_util::future::{select_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;

type StorageCtor = fn(toml::Table) -> BoxFuture<'static, Result<Arc<dyn Storage>, Error>>;
type StorageTransportCtor =
    fn(Arc<dyn Storage>, toml::Table) -> Result<Box<dyn StorageTransport>, Error>;
type QueryTransportCtor =
    fn(Arc<dyn Storage>, toml::Table) -> Result<Box<dyn QueryTransport>, Error>;

/// Name-keyed constructors for storage engines and transports.
///
/// The default registry knows everything this crate ships: the `postgres`
/// and `memory` engines, the `grpc` storage transport and the `http` and
/// `zipkin` query transports. Embedders can add their own before building
/// the server; the configuration file refers to all of them by name.
pub struct Registry {
    storages: HashMap<&'static str, StorageCtor>,
    storage_transports: HashMap<&'static str, StorageTransportCtor>,
    query_transports: HashMap<&'static str, QueryTransportCtor>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Registry::empty();
        registry.register_storage("postgres", storage::postgres::setup);
        registry.register_storage("memory", storage::memory::setup);
        registry.register_storage_transport("grpc", transport::grpc::setup);
        registry.register_query_transport("http", transport::http::setup);
        registry.register_query_transport("zipkin", transport::zipkin::setup);
        registry
    }
}

impl Registry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Registry {
            storages: HashMap::new(),
            storage_transports: HashMap::new(),
            query_transports: HashMap::new(),
        }
    }

    pub fn register_storage(&mut self, name: &'static str, ctor: StorageCtor) {
        self.storages.insert(name, ctor);
    }

    pub fn register_storage_transport(&mut self, name: &'static str, ctor: StorageTransportCtor) {
        self.storage_transports.insert(name, ctor);
    }

    pub fn register_query_transport(&mut self, name: &'static str, ctor: QueryTransportCtor) {
        self.query_transports.insert(name, ctor);
    }
}

/// A configured collector: one storage engine, one storage transport and
/// any number of query transports.
pub struct Server {
    storage: Arc<dyn Storage>,
    storage_transport: Box<dyn StorageTransport>,
    query_transports: Vec<Box<dyn QueryTransport>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("storage", &self.storage)
            .field("query_transports", &self.query_transports.len())
            .finish()
    }
}

impl Server {
    /// Builds a server from a configuration file, resolving every engine
    /// and transport name through `registry`.
    pub async fn from_config(registry: &Registry, config: &Config) -> Result<Server, Error> {
        let engine = config.storage_engine()?;
        let ctor = registry
            .storages
            .get(engine)
            .ok_or_else(|| Error::UnknownStorage(engine.to_owned()))?;
        let storage = ctor(config.storage_engine_config()?).await?;

        let name = config.storage_transport()?;
        let ctor = registry
            .storage_transports
            .get(name)
            .ok_or_else(|| Error::UnknownStorageTransport(name.to_owned()))?;
        let storage_transport = ctor(storage.clone(), config.storage_transport_config()?)?;

        let mut query_transports = Vec::new();
        for name in config.query_transports()? {
            let ctor = registry
                .query_transports
                .get(name.as_str())
                .ok_or_else(|| Error::UnknownQueryTransport(name.clone()))?;
            query_transports.push(ctor(storage.clone(), config.query_transport_config(&name)?)?);
        }

        Ok(Server {
            storage,
            storage_transport,
            query_transports,
        })
    }

    /// The storage engine this server persists to.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Runs every transport until the first of them fails.
    pub async fn run(self) -> Result<(), Error> {
        let mut tasks = vec![tokio::spawn(self.storage_transport.serve())];
        for transport in self.query_transports {
            tasks.push(tokio::spawn(transport.serve()));
        }
        let (result, _, _) = select_all(tasks).await;
        result?
    }
}
