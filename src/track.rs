//! Track - validated, per-request access to Mixpanel.
//!
//! A [`Track`] binds the current user (`distinct_id`) to every call, checks
//! each event and property against the resolved vocabularies, shapes the
//! Mixpanel payload and hands it to the consumer. When customer.io is
//! configured, [`Track::track`] and [`Track::profile_set`] are mirrored as
//! well.
//!
//! Nothing leaves the process until [`Track::flush`]; the lifecycle glue in
//! [`middleware`](crate::middleware) does that at the end of each request.
//!
//! # Example
//!
//! ```rust,ignore
//! use mixtrack::{EventProperties, Events, Properties, Track};
//! use serde_json::json;
//!
//! let mut track = Track::init(&config, &registry, &transports, Some("user-1".into()))?;
//! track.track(
//!     &Events::PAGE_VIEWED,
//!     Properties::from([(EventProperties::PATH, json!("/hello"))]),
//! )?;
//! track.flush().await;
//! ```

use crate::config::{ConfigError, TrackConfig};
use crate::consumer::{
    Consumer, ConsumerContext, ConsumerKind, Endpoint, Message, MockedConsumer, Recording,
    Transports,
};
use crate::customerio::{CustomerIo, SecondaryCall, SecondarySink};
use crate::registry::Registry;
use crate::vocabulary::{Event, Property, Vocabulary, VocabularyKind};
use crate::{LIB_NAME, LIB_VERSION, TESTING_TOKEN};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Property values keyed by [`Property`].
pub type Properties = BTreeMap<Property, Value>;

/// Errors raised by [`Track`] operations, always before anything is sent.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("distinct_id must be set before you can send events or set properties")]
    DistinctIdRequired,

    #[error("Event '{0}' is not a member of events")]
    UnknownEvent(Event),

    #[error("Property '{property}' is not a member of {vocabulary}")]
    UnknownProperty {
        property: Property,
        vocabulary: &'static str,
    },

    #[error("Property '{0}' value is not a list")]
    NotAList(Property),

    /// Building the per-request `Track` failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Per-request tracking engine.
pub struct Track {
    distinct_id: Option<String>,
    token: String,

    events: Vocabulary<Event>,
    event_properties: Vocabulary<Property>,
    profile_properties: Vocabulary<Property>,
    profile_meta_properties: Vocabulary<Property>,

    /// Merged under the explicit properties of every `track` call
    global_event_props: Properties,

    consumer: Box<dyn Consumer>,

    customerio: Option<Arc<dyn SecondarySink>>,
}

impl Track {
    /// Resolve configuration and build a `Track` for one request.
    ///
    /// Without a token, or with `testing = true`, the configured consumer is
    /// only checked to name a consumer. A [`MockedConsumer`] records instead
    /// and the token becomes `"testing"`.
    pub fn init(
        config: &TrackConfig,
        registry: &Registry,
        transports: &Transports,
        distinct_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let settings = &config.mixpanel;
        let testing = settings.is_testing();

        let customerio = CustomerIo::from_config(&config.customerio, transports.http.clone())?
            .map(|cio| Arc::new(cio) as Arc<dyn SecondarySink>);

        let token = match settings.token() {
            Some(token) if !testing => token.to_string(),
            _ => TESTING_TOKEN.to_string(),
        };

        let ctx = ConsumerContext {
            token: token.clone(),
            api_host: settings.api_host.clone(),
            http: transports.http.clone(),
            customerio: customerio.clone(),
            queue: transports.queue.clone(),
            strip_bookkeeping: settings.strip_bookkeeping,
        };

        let events = registry.resolve_events(settings.vocabulary_setting(VocabularyKind::Events))?;
        let event_properties = resolve(registry, config, VocabularyKind::EventProperties)?;
        let profile_properties = resolve(registry, config, VocabularyKind::ProfileProperties)?;
        let profile_meta_properties =
            resolve(registry, config, VocabularyKind::ProfileMetaProperties)?;

        let consumer: Box<dyn Consumer> = if testing {
            registry.check_consumer(settings.consumer.as_ref())?;
            Box::new(MockedConsumer::from_context(&ctx))
        } else {
            registry.resolve_consumer(settings.consumer.as_ref(), &ctx)?
        };

        Ok(Self {
            distinct_id: distinct_id.filter(|id| !id.is_empty()),
            token,
            events,
            event_properties,
            profile_properties,
            profile_meta_properties,
            global_event_props: Properties::new(),
            consumer,
            customerio,
        })
    }

    pub fn distinct_id(&self) -> Option<&str> {
        self.distinct_id.as_deref()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn events(&self) -> &Vocabulary<Event> {
        &self.events
    }

    pub fn event_properties(&self) -> &Vocabulary<Property> {
        &self.event_properties
    }

    pub fn profile_properties(&self) -> &Vocabulary<Property> {
        &self.profile_properties
    }

    pub fn profile_meta_properties(&self) -> &Vocabulary<Property> {
        &self.profile_meta_properties
    }

    pub fn consumer_name(&self) -> &str {
        self.consumer.name()
    }

    pub fn consumer_kind(&self) -> ConsumerKind {
        self.consumer.kind()
    }

    /// Recorded messages, when the consumer records them.
    pub fn recording(&self) -> Option<Recording> {
        self.consumer.recording()
    }

    pub fn has_customerio(&self) -> bool {
        self.customerio.is_some()
    }

    pub fn global_event_props(&self) -> &Properties {
        &self.global_event_props
    }

    /// Replace the properties added to every tracked event.
    pub fn set_global_event_props(&mut self, props: Properties) {
        self.global_event_props = props;
    }

    /// Whether request teardown has to call [`Track::flush`].
    pub fn requires_flush(&self) -> bool {
        self.consumer.kind().requires_flush()
    }

    /// Deliver everything sent so far. Never fails.
    pub async fn flush(&mut self) {
        self.consumer.flush().await;
    }

    /// Track a Mixpanel event.
    pub fn track(&mut self, event: &Event, props: Properties) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;

        if !self.events.contains(event) {
            return Err(TrackError::UnknownEvent(event.clone()));
        }

        let mut merged = self.global_event_props.clone();
        merged.extend(props);
        check_members(&self.event_properties, VocabularyKind::EventProperties, &merged)?;

        let mut properties = Map::new();
        properties.insert("token".into(), json!(self.token));
        properties.insert("distinct_id".into(), json!(distinct_id));
        properties.insert("time".into(), json!(now()));
        properties.insert("$insert_id".into(), json!(Uuid::new_v4().simple().to_string()));
        properties.insert("mp_lib".into(), json!(LIB_NAME));
        properties.insert("$lib_version".into(), json!(LIB_VERSION));
        properties.extend(display_names(&merged));

        let mut payload = Map::new();
        payload.insert("event".into(), json!(event.name()));
        payload.insert("properties".into(), Value::Object(properties));

        debug!(event = %event, distinct_id = %distinct_id, "Tracking event");
        self.consumer.send(Message::new(Endpoint::Events, payload));

        if self.customerio.is_some() {
            let call = SecondaryCall::Track {
                customer_id: distinct_id,
                name: event.name().to_string(),
                data: unprefixed_names(&merged),
            };
            self.consumer.send(call.into_message());
        }

        Ok(())
    }

    /// Set properties on a profile, creating it if needed.
    ///
    /// `meta` carries Mixpanel's special top-level fields, such as `$ip`.
    pub fn profile_set(&mut self, props: Properties, meta: Properties) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;
        check_members(&self.profile_properties, VocabularyKind::ProfileProperties, &props)?;
        check_members(
            &self.profile_meta_properties,
            VocabularyKind::ProfileMetaProperties,
            &meta,
        )?;

        self.send_people(&distinct_id, "$set", display_names(&props), &meta);

        if self.customerio.is_some() {
            let mut attributes = unprefixed_names(&props);
            attributes.extend(unprefixed_names(&meta));
            let call = SecondaryCall::Identify {
                id: distinct_id,
                attributes,
            };
            self.consumer.send(call.into_message());
        }

        Ok(())
    }

    /// Append values to list properties of a profile.
    pub fn people_append(&mut self, props: Properties, meta: Properties) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;
        check_members(&self.profile_properties, VocabularyKind::ProfileProperties, &props)?;
        check_members(
            &self.profile_meta_properties,
            VocabularyKind::ProfileMetaProperties,
            &meta,
        )?;

        self.send_people(&distinct_id, "$append", display_names(&props), &meta);
        Ok(())
    }

    /// Merge lists into list properties of a profile.
    ///
    /// Every value, regular and meta, must be a JSON array.
    pub fn people_union(&mut self, props: Properties, meta: Properties) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;
        check_lists(&self.profile_properties, VocabularyKind::ProfileProperties, &props)?;
        check_lists(
            &self.profile_meta_properties,
            VocabularyKind::ProfileMetaProperties,
            &meta,
        )?;

        self.send_people(&distinct_id, "$union", display_names(&props), &meta);
        Ok(())
    }

    /// Increment numeric properties of a profile.
    pub fn profile_increment(&mut self, props: Properties) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;
        check_members(&self.profile_properties, VocabularyKind::ProfileProperties, &props)?;

        self.send_people(&distinct_id, "$add", display_names(&props), &Properties::new());
        Ok(())
    }

    /// Record a charge in the profile's `$transactions` list.
    pub fn profile_track_charge(
        &mut self,
        amount: f64,
        props: Properties,
    ) -> Result<(), TrackError> {
        let distinct_id = self.require_distinct_id()?;
        check_members(&self.profile_properties, VocabularyKind::ProfileProperties, &props)?;

        let mut transaction = display_names(&props);
        transaction.insert("$amount".into(), json!(amount));

        let mut append = Map::new();
        append.insert("$transactions".into(), Value::Object(transaction));

        self.send_people(&distinct_id, "$append", append, &Properties::new());
        Ok(())
    }

    fn require_distinct_id(&self) -> Result<String, TrackError> {
        self.distinct_id
            .clone()
            .ok_or(TrackError::DistinctIdRequired)
    }

    fn send_people(
        &mut self,
        distinct_id: &str,
        operation: &str,
        values: Map<String, Value>,
        meta: &Properties,
    ) {
        let mut payload = Map::new();
        payload.insert("$token".into(), json!(self.token));
        payload.insert("$time".into(), json!(now()));
        payload.insert("$distinct_id".into(), json!(distinct_id));
        payload.insert(operation.into(), Value::Object(values));
        payload.extend(display_names(meta));

        debug!(operation = %operation, distinct_id = %distinct_id, "Updating profile");
        self.consumer.send(Message::new(Endpoint::People, payload));
    }
}

fn resolve(
    registry: &Registry,
    config: &TrackConfig,
    kind: VocabularyKind,
) -> Result<Vocabulary<Property>, ConfigError> {
    registry.resolve_properties(kind, config.mixpanel.vocabulary_setting(kind))
}

/// Epoch seconds
fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fail on the first property that is not part of `vocabulary`.
fn check_members(
    vocabulary: &Vocabulary<Property>,
    kind: VocabularyKind,
    props: &Properties,
) -> Result<(), TrackError> {
    match props.keys().find(|prop| !vocabulary.contains(prop)) {
        Some(prop) => Err(TrackError::UnknownProperty {
            property: prop.clone(),
            vocabulary: kind.field_name(),
        }),
        None => Ok(()),
    }
}

fn check_lists(
    vocabulary: &Vocabulary<Property>,
    kind: VocabularyKind,
    props: &Properties,
) -> Result<(), TrackError> {
    for (prop, value) in props {
        if !vocabulary.contains(prop) {
            return Err(TrackError::UnknownProperty {
                property: prop.clone(),
                vocabulary: kind.field_name(),
            });
        }
        if !value.is_array() {
            return Err(TrackError::NotAList(prop.clone()));
        }
    }
    Ok(())
}

fn display_names(props: &Properties) -> Map<String, Value> {
    props
        .iter()
        .map(|(prop, value)| (prop.name().to_string(), value.clone()))
        .collect()
}

/// customer.io has no reserved names, so `$email` becomes `email`.
fn unprefixed_names(props: &Properties) -> Map<String, Value> {
    props
        .iter()
        .map(|(prop, value)| (prop.unprefixed_name().to_string(), value.clone()))
        .collect()
}
