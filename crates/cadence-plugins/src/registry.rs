//! Explicit tag → factory registry for every pluggable collaborator.

use crate::exec::{ExecBootstrapper, ExecBuilder};
use crate::labels::DefaultLabelIncrementer;
use crate::log::{LogListener, LogPublisher};
use crate::socket::SocketPublisher;
use crate::sources::{AlwaysChanged, FileSystemSource};
use crate::webhook::WebhookPublisher;
use cadence_core::plugin::PluginSpec;
use cadence_core::ports::{
    Bootstrapper, Builder, LabelIncrementer, Listener, Publisher, SourceControl,
};
use cadence_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type Factory<T> = Arc<dyn Fn(&PluginSpec) -> Result<Arc<T>> + Send + Sync>;

struct Table<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            factories: self.factories.clone(),
        }
    }
}

impl<T: ?Sized> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    fn register(&mut self, tag: &str, factory: Factory<T>) {
        debug!(kind = self.kind, tag = %tag, "Registering plugin");
        self.factories.insert(tag.to_string(), factory);
    }

    fn create(&self, spec: &PluginSpec) -> Result<Arc<T>> {
        let factory = self
            .factories
            .get(&spec.tag)
            .ok_or_else(|| Error::PluginNotFound {
                kind: self.kind,
                tag: spec.tag.clone(),
            })?;
        factory(spec)
    }

    fn tags(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Registry of plugin factories keyed by the `type` tag used in configuration.
#[derive(Clone)]
pub struct PluginRegistry {
    builders: Table<dyn Builder>,
    bootstrappers: Table<dyn Bootstrapper>,
    sources: Table<dyn SourceControl>,
    publishers: Table<dyn Publisher>,
    listeners: Table<dyn Listener>,
    label_incrementers: Table<dyn LabelIncrementer>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            builders: Table::new("builder"),
            bootstrappers: Table::new("bootstrapper"),
            sources: Table::new("source"),
            publishers: Table::new("publisher"),
            listeners: Table::new("listener"),
            label_incrementers: Table::new("label incrementer"),
        }
    }

    /// A registry populated with the built-in plugins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builder("exec", |spec| Ok(Arc::new(ExecBuilder::from_spec(spec)?)));
        registry.register_bootstrapper("exec", |spec| {
            Ok(Arc::new(ExecBootstrapper::from_spec(spec)?))
        });
        registry.register_source("filesystem", |spec| {
            Ok(Arc::new(FileSystemSource::from_spec(spec)?))
        });
        registry.register_source("always", |spec| Ok(Arc::new(AlwaysChanged::from_spec(spec))));
        registry.register_publisher("log", |_| Ok(Arc::new(LogPublisher)));
        registry.register_publisher("socket", |spec| {
            Ok(Arc::new(SocketPublisher::from_spec(spec)?))
        });
        registry.register_publisher("webhook", |spec| {
            Ok(Arc::new(WebhookPublisher::from_spec(spec)?))
        });
        registry.register_listener("log", |_| Ok(Arc::new(LogListener)));
        registry.register_label_incrementer("default", |spec| {
            Ok(Arc::new(DefaultLabelIncrementer::from_spec(spec)))
        });
        registry
    }

    pub fn register_builder<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn Builder>> + Send + Sync + 'static,
    {
        self.builders.register(tag, Arc::new(factory));
    }

    pub fn register_bootstrapper<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn Bootstrapper>> + Send + Sync + 'static,
    {
        self.bootstrappers.register(tag, Arc::new(factory));
    }

    pub fn register_source<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn SourceControl>> + Send + Sync + 'static,
    {
        self.sources.register(tag, Arc::new(factory));
    }

    pub fn register_publisher<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn Publisher>> + Send + Sync + 'static,
    {
        self.publishers.register(tag, Arc::new(factory));
    }

    pub fn register_listener<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn Listener>> + Send + Sync + 'static,
    {
        self.listeners.register(tag, Arc::new(factory));
    }

    pub fn register_label_incrementer<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Result<Arc<dyn LabelIncrementer>> + Send + Sync + 'static,
    {
        self.label_incrementers.register(tag, Arc::new(factory));
    }

    pub fn create_builder(&self, spec: &PluginSpec) -> Result<Arc<dyn Builder>> {
        self.builders.create(spec)
    }

    pub fn create_bootstrapper(&self, spec: &PluginSpec) -> Result<Arc<dyn Bootstrapper>> {
        self.bootstrappers.create(spec)
    }

    pub fn create_source(&self, spec: &PluginSpec) -> Result<Arc<dyn SourceControl>> {
        self.sources.create(spec)
    }

    pub fn create_publisher(&self, spec: &PluginSpec) -> Result<Arc<dyn Publisher>> {
        self.publishers.create(spec)
    }

    pub fn create_listener(&self, spec: &PluginSpec) -> Result<Arc<dyn Listener>> {
        self.listeners.create(spec)
    }

    pub fn create_label_incrementer(&self, spec: &PluginSpec) -> Result<Arc<dyn LabelIncrementer>> {
        self.label_incrementers.create(spec)
    }

    /// Registered builder tags, sorted.
    pub fn builder_tags(&self) -> Vec<String> {
        self.builders.tags()
    }

    pub fn source_tags(&self) -> Vec<String> {
        self.sources.tags()
    }

    pub fn publisher_tags(&self) -> Vec<String> {
        self.publishers.tags()
    }
}
