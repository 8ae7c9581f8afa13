//! Registry of vocabularies and consumers by identifier.
//!
//! Configuration refers to vocabularies and consumers by name
//! (`profile_properties = "AppProfileProperties"`). The [`Registry`] maps
//! those names to factories and checks, once, that whatever they build is
//! acceptable: vocabulary overrides must include their baseline, consumer
//! identifiers must name a consumer.
//!
//! ```rust,ignore
//! use mixtrack::registry::Registry;
//! use mixtrack::{Property, ProfileProperties};
//!
//! let mut registry = Registry::new();
//! registry.register_properties("AppProfileProperties", || {
//!     ProfileProperties::vocabulary()
//!         .extend("AppProfileProperties", [("state", Property::new("State"))])
//! });
//! ```

use crate::config::ConfigError;
use crate::consumer::{
    Consumer, ConsumerContext, MockedConsumer, PoliteBufferedConsumer, QueuedConsumer,
};
use crate::vocabulary::{
    baseline_properties, EventProperties, Events, ProfileMetaProperties, ProfileProperties,
    Vocabulary, VocabularyKind,
};
use crate::{Event, Property};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an event vocabulary
pub type EventsFactory = Arc<dyn Fn() -> Vocabulary<Event> + Send + Sync>;

/// Builds a property vocabulary
pub type PropertiesFactory = Arc<dyn Fn() -> Vocabulary<Property> + Send + Sync>;

/// Builds a consumer for one [`Track`](crate::Track)
pub type ConsumerFactory =
    Arc<dyn Fn(&ConsumerContext) -> Result<Box<dyn Consumer>, ConfigError> + Send + Sync>;

/// Base every consumer identifier must resolve to
const CONSUMER_BASE: &str = "mixtrack::Consumer";

/// Default consumer when none is configured
const DEFAULT_CONSUMER: &str = "PoliteBufferedConsumer";

#[derive(Clone)]
enum Entry {
    Events(EventsFactory),
    Properties(PropertiesFactory),
    Consumer(ConsumerFactory),
}

/// Identifier -> factory table used to resolve configuration.
#[derive(Clone)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Create a registry holding the built-in vocabularies and consumers.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };

        registry.register_events("Events", Events::vocabulary);
        registry.register_properties("EventProperties", EventProperties::vocabulary);
        registry.register_properties("ProfileProperties", ProfileProperties::vocabulary);
        registry.register_properties("ProfileMetaProperties", ProfileMetaProperties::vocabulary);

        registry.register_consumer("PoliteBufferedConsumer", |ctx| {
            Ok(Box::new(PoliteBufferedConsumer::from_context(ctx)))
        });
        registry.register_consumer("MockedConsumer", |ctx| {
            Ok(Box::new(MockedConsumer::from_context(ctx)))
        });
        registry.register_consumer("QueuedConsumer", |ctx| {
            Ok(Box::new(QueuedConsumer::from_context(ctx)?))
        });

        registry
    }

    /// Register an event vocabulary under `id`, replacing any previous entry.
    pub fn register_events<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Vocabulary<Event> + Send + Sync + 'static,
    {
        self.entries.insert(id.into(), Entry::Events(Arc::new(factory)));
    }

    /// Register a property vocabulary under `id`.
    ///
    /// Which kind it may stand in for is decided at resolution time by
    /// checking it against that kind's baseline.
    pub fn register_properties<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Vocabulary<Property> + Send + Sync + 'static,
    {
        self.entries
            .insert(id.into(), Entry::Properties(Arc::new(factory)));
    }

    pub fn register_consumer<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&ConsumerContext) -> Result<Box<dyn Consumer>, ConfigError> + Send + Sync + 'static,
    {
        self.entries
            .insert(id.into(), Entry::Consumer(Arc::new(factory)));
    }

    /// List all registered identifiers, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve the event vocabulary.
    pub fn resolve_events(
        &self,
        setting: Option<&toml::Value>,
    ) -> Result<Vocabulary<Event>, ConfigError> {
        let baseline = Events::vocabulary();
        let Some(id) = identifier(setting_name(VocabularyKind::Events), setting)? else {
            return Ok(baseline);
        };

        match self.lookup(setting_name(VocabularyKind::Events), id)? {
            Entry::Events(factory) => {
                let vocabulary = factory();
                if vocabulary.includes(&baseline) {
                    Ok(vocabulary)
                } else {
                    Err(not_based_on(id, VocabularyKind::Events.base_name()))
                }
            }
            _ => Err(not_based_on(id, VocabularyKind::Events.base_name())),
        }
    }

    /// Resolve one of the three property vocabularies.
    ///
    /// [`VocabularyKind::Events`] is not a property kind and is reported as
    /// [`ConfigError::NotBasedOn`].
    pub fn resolve_properties(
        &self,
        kind: VocabularyKind,
        setting: Option<&toml::Value>,
    ) -> Result<Vocabulary<Property>, ConfigError> {
        let Some(baseline) = baseline_properties(kind) else {
            return Err(not_based_on(kind.base_name(), "a property vocabulary"));
        };
        let Some(id) = identifier(setting_name(kind), setting)? else {
            return Ok(baseline);
        };

        match self.lookup(setting_name(kind), id)? {
            Entry::Properties(factory) => {
                let vocabulary = factory();
                if vocabulary.includes(&baseline) {
                    Ok(vocabulary)
                } else {
                    Err(not_based_on(id, kind.base_name()))
                }
            }
            _ => Err(not_based_on(id, kind.base_name())),
        }
    }

    /// Resolve and build the consumer; unset means [`PoliteBufferedConsumer`].
    pub fn resolve_consumer(
        &self,
        setting: Option<&toml::Value>,
        ctx: &ConsumerContext,
    ) -> Result<Box<dyn Consumer>, ConfigError> {
        let factory = self.consumer_factory(setting)?;
        factory(ctx)
    }

    /// Check that the setting names a consumer without building it.
    pub fn check_consumer(&self, setting: Option<&toml::Value>) -> Result<(), ConfigError> {
        self.consumer_factory(setting).map(|_| ())
    }

    fn consumer_factory(
        &self,
        setting: Option<&toml::Value>,
    ) -> Result<&ConsumerFactory, ConfigError> {
        let id = identifier("mixpanel.consumer", setting)?.unwrap_or(DEFAULT_CONSUMER);

        match self.lookup("mixpanel.consumer", id)? {
            Entry::Consumer(factory) => Ok(factory),
            _ => Err(not_based_on(id, CONSUMER_BASE)),
        }
    }

    fn lookup(&self, setting: &'static str, id: &str) -> Result<&Entry, ConfigError> {
        self.entries
            .get(id)
            .ok_or_else(|| ConfigError::UnknownIdentifier {
                setting,
                identifier: id.to_string(),
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn setting_name(kind: VocabularyKind) -> &'static str {
    match kind {
        VocabularyKind::Events => "mixpanel.events",
        VocabularyKind::EventProperties => "mixpanel.event_properties",
        VocabularyKind::ProfileProperties => "mixpanel.profile_properties",
        VocabularyKind::ProfileMetaProperties => "mixpanel.profile_meta_properties",
    }
}

/// The identifier in a setting; `None` when unset or empty.
fn identifier<'a>(
    setting: &'static str,
    value: Option<&'a toml::Value>,
) -> Result<Option<&'a str>, ConfigError> {
    match value {
        None => Ok(None),
        Some(toml::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.trim())),
        Some(other) => Err(ConfigError::NotAnIdentifier {
            setting,
            found: other.type_str(),
        }),
    }
}

fn not_based_on(identifier: &str, base: &str) -> ConfigError {
    ConfigError::NotBasedOn {
        identifier: identifier.to_string(),
        base: base.to_string(),
    }
}
