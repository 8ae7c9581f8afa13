//! axum glue: one lazily built [`Track`] per request, flushed at the end.
//!
//! ```rust,ignore
//! use axum::{middleware, routing::get, Extension, Router};
//! use mixtrack::middleware::{mixpanel_middleware, MixpanelState, RequestMixpanel};
//!
//! let state = MixpanelState::new(TrackConfig::load()?, Registry::new())?;
//! let app = Router::new()
//!     .route("/", get(index))
//!     .layer(middleware::from_fn_with_state(state, mixpanel_middleware));
//!
//! async fn index(Extension(mixpanel): Extension<RequestMixpanel>) {
//!     mixpanel.with(|track| track.track(&Events::PAGE_VIEWED, Properties::new()))?;
//! }
//! ```
//!
//! Upstream authentication binds the current user by inserting a
//! [`DistinctId`] request extension before this middleware runs.
//!
//! Requests carrying `X-Mixpanel-<Name>` headers get `<name>` (lower-cased,
//! looked up as a symbolic key in the event properties vocabulary) added to
//! every event tracked during that request.

use crate::config::{ConfigError, TrackConfig};
use crate::consumer::{ConsumerKind, Transports};
use crate::registry::Registry;
use crate::track::{Properties, Track, TrackError};
use crate::MIXPANEL_HEADER_PREFIX;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

struct StateInner {
    config: TrackConfig,
    registry: Registry,
    transports: Transports,
}

/// Application-wide tracking setup, shared by all requests.
#[derive(Clone)]
pub struct MixpanelState {
    inner: Arc<StateInner>,
}

impl MixpanelState {
    /// Validate configuration and log how Mixpanel is set up.
    pub fn new(config: TrackConfig, registry: Registry) -> Result<Self, ConfigError> {
        Self::with_transports(config, registry, Transports::default())
    }

    /// Like [`MixpanelState::new`], sharing an HTTP client and task queue.
    pub fn with_transports(
        config: TrackConfig,
        registry: Registry,
        transports: Transports,
    ) -> Result<Self, ConfigError> {
        // Fail fast: building one Track resolves every setting
        let track = Track::init(&config, &registry, &transports, None)?;

        info!(
            consumer = %track.consumer_name(),
            events = %track.events().name(),
            event_properties = %track.event_properties().name(),
            profile_properties = %track.profile_properties().name(),
            profile_meta_properties = %track.profile_meta_properties().name(),
            customerio = track.has_customerio(),
            "Mixpanel configured"
        );
        if track.consumer_kind() == ConsumerKind::Mocked {
            warn!("Mixpanel is in testing mode, no message will be sent!");
        }

        Ok(Self {
            inner: Arc::new(StateInner {
                config,
                registry,
                transports,
            }),
        })
    }

    /// Build a fresh [`Track`] for `distinct_id`.
    pub fn init(&self, distinct_id: Option<String>) -> Result<Track, ConfigError> {
        let inner = &self.inner;
        Track::init(&inner.config, &inner.registry, &inner.transports, distinct_id)
    }

    pub fn config(&self) -> &TrackConfig {
        &self.inner.config
    }
}

/// The authenticated user of a request, set by upstream middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinctId(pub String);

struct Slot {
    distinct_id: Option<String>,

    /// (header name, lower-cased suffix, value)
    header_props: Vec<(String, String, String)>,

    track: Option<Track>,
}

/// Per-request handle to the lazily built [`Track`].
///
/// Inserted into request extensions by [`mixpanel_middleware`].
#[derive(Clone)]
pub struct RequestMixpanel {
    state: MixpanelState,
    slot: Arc<Mutex<Slot>>,
}

impl RequestMixpanel {
    pub fn new(
        state: MixpanelState,
        distinct_id: Option<String>,
        header_props: Vec<(String, String, String)>,
    ) -> Self {
        Self {
            state,
            slot: Arc::new(Mutex::new(Slot {
                distinct_id,
                header_props,
                track: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the user for this request.
    ///
    /// Only possible before the `Track` is built; returns whether it took.
    pub fn bind_distinct_id(&self, distinct_id: impl Into<String>) -> bool {
        let mut slot = self.lock();
        if slot.track.is_some() {
            return false;
        }
        slot.distinct_id = Some(distinct_id.into());
        true
    }

    /// Whether the `Track` has been built during this request.
    pub fn is_initialized(&self) -> bool {
        self.lock().track.is_some()
    }

    /// Run `f` against this request's `Track`, building it on first use.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut Track) -> Result<R, TrackError>,
    ) -> Result<R, TrackError> {
        let mut slot = self.lock();
        let track = match slot.track.take() {
            Some(track) => track,
            None => self.build(&slot)?,
        };
        f(slot.track.insert(track))
    }

    fn build(&self, slot: &Slot) -> Result<Track, TrackError> {
        let mut track = self.state.init(slot.distinct_id.clone())?;

        let mut props = Properties::new();
        for (header, name, value) in &slot.header_props {
            match track.event_properties().get(name) {
                Some(prop) => {
                    props.insert(prop.clone(), Value::String(value.clone()));
                }
                None => warn!(
                    property = %name,
                    header = %header,
                    "Property '{}', from request header '{}' is not a member of event_properties",
                    name,
                    header
                ),
            }
        }
        track.set_global_event_props(props);

        debug!(distinct_id = ?track.distinct_id(), "Mixpanel initialized for request");
        Ok(track)
    }

    /// Flush the `Track`, if one was built and its consumer needs it.
    pub async fn finish(&self) {
        let track = self.lock().track.take();
        let Some(mut track) = track else {
            return;
        };

        if track.requires_flush() {
            track.flush().await;
        }
    }
}

/// Collect `X-Mixpanel-*` headers as (header, suffix, value).
fn header_props(req: &Request) -> Vec<(String, String, String)> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            let suffix = name.as_str().strip_prefix(MIXPANEL_HEADER_PREFIX)?;
            match value.to_str() {
                Ok(value) => Some((
                    name.to_string(),
                    suffix.to_lowercase(),
                    value.to_string(),
                )),
                Err(_) => {
                    warn!(header = %name, "Ignoring non-ASCII Mixpanel header");
                    None
                }
            }
        })
        .collect()
}

/// Attach a [`RequestMixpanel`] to the request and flush it afterwards.
pub async fn mixpanel_middleware(
    State(state): State<MixpanelState>,
    mut req: Request,
    next: Next,
) -> Response {
    let distinct_id = req.extensions().get::<DistinctId>().map(|id| id.0.clone());
    let mixpanel = RequestMixpanel::new(state, distinct_id, header_props(&req));
    req.extensions_mut().insert(mixpanel.clone());

    let response = next.run(req).await;

    mixpanel.finish().await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{Consumer, Message, Recording};
    use crate::test_support::capture_logs;
    use crate::vocabulary::{EventProperties, Events, ProfileProperties};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{middleware, Extension, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;
    use tracing::Level;

    #[derive(Default)]
    struct Counters {
        built: AtomicUsize,
        flushed: AtomicUsize,
    }

    struct CountingConsumer {
        kind: ConsumerKind,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Consumer for CountingConsumer {
        fn name(&self) -> &str {
            "CountingConsumer"
        }

        fn kind(&self) -> ConsumerKind {
            self.kind
        }

        fn send(&mut self, _message: Message) {}

        async fn flush(&mut self) {
            self.counters.flushed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_state(kind: ConsumerKind) -> (MixpanelState, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut registry = Registry::new();
        let shared = counters.clone();
        registry.register_consumer("CountingConsumer", move |_ctx| {
            shared.built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingConsumer {
                kind,
                counters: shared.clone(),
            }))
        });

        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            token = "secret"
            consumer = "CountingConsumer"
        "#,
        )
        .unwrap();
        let state = MixpanelState::new(config, registry).unwrap();
        (state, counters)
    }

    fn testing_state() -> MixpanelState {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            strip_bookkeeping = true
        "#,
        )
        .unwrap();
        MixpanelState::new(config, Registry::new()).unwrap()
    }

    async fn hello(
        Extension(mixpanel): Extension<RequestMixpanel>,
    ) -> (Extension<Recording>, StatusCode) {
        mixpanel
            .with(|track| {
                track.track(
                    &Events::PAGE_VIEWED,
                    Properties::from([(EventProperties::PATH, json!("/hello"))]),
                )
            })
            .unwrap();
        let recording = mixpanel.with(|track| Ok(track.recording())).unwrap();
        (Extension(recording.unwrap_or_default()), StatusCode::OK)
    }

    async fn bind(
        Extension(mixpanel): Extension<RequestMixpanel>,
    ) -> (Extension<Recording>, StatusCode) {
        assert!(mixpanel.bind_distinct_id("bar"));
        mixpanel
            .with(|track| {
                track.profile_set(
                    Properties::from([(ProfileProperties::DOLLAR_NAME, json!("Bar"))]),
                    Properties::new(),
                )
            })
            .unwrap();
        assert!(!mixpanel.bind_distinct_id("baz"));
        let recording = mixpanel.with(|track| Ok(track.recording())).unwrap();
        (Extension(recording.unwrap_or_default()), StatusCode::OK)
    }

    async fn bye() -> StatusCode {
        StatusCode::OK
    }

    async fn set_user(mut req: Request, next: Next) -> Response {
        req.extensions_mut().insert(DistinctId("foo".into()));
        next.run(req).await
    }

    fn app(state: MixpanelState) -> Router {
        Router::new()
            .route("/hello", get(hello))
            .route("/bind", get(bind))
            .route("/bye", get(bye))
            .layer(middleware::from_fn_with_state(state, mixpanel_middleware))
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_state_logs_configuration() {
        let (logs, _guard) = capture_logs();
        let state = testing_state();

        let configured = logs.at_level(Level::INFO);
        let configured = configured
            .iter()
            .find(|e| e.message == "Mixpanel configured")
            .unwrap();
        assert_eq!(configured.fields["consumer"], "MockedConsumer");
        assert_eq!(configured.fields["events"], "Events");
        assert_eq!(configured.fields["profile_properties"], "ProfileProperties");
        assert_eq!(configured.fields["customerio"], "false");
        assert!(logs.has_event(
            Level::WARN,
            "Mixpanel is in testing mode, no message will be sent!"
        ));

        // Building per-request Tracks does not log configuration again
        let before = logs.entries().len();
        state.init(Some("foo".into())).unwrap();
        assert!(logs.entries()[before..]
            .iter()
            .all(|e| e.message != "Mixpanel configured"));
    }

    #[test]
    fn test_state_rejects_bad_config() {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            consumer = "Nope"
        "#,
        )
        .unwrap();
        assert!(matches!(
            MixpanelState::new(config, Registry::new()),
            Err(ConfigError::UnknownIdentifier { .. })
        ));
    }

    #[test]
    fn test_testing_state_accepts_queued_consumer_without_queue() {
        let config = TrackConfig::from_toml_str(
            r#"
            [mixpanel]
            consumer = "QueuedConsumer"
        "#,
        )
        .unwrap();
        let state = MixpanelState::new(config, Registry::new()).unwrap();
        assert!(state.config().mixpanel.is_testing());

        let track = state.init(Some("foo".into())).unwrap();
        assert_eq!(track.consumer_kind(), ConsumerKind::Mocked);
    }

    #[tokio::test]
    async fn test_request_tracks_and_flushes() {
        let app = app(testing_state()).layer(middleware::from_fn(set_user));

        let response = app.oneshot(get_request("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let recording = response.extensions().get::<Recording>().unwrap();
        assert!(recording.flushed());
        assert_eq!(
            recording.messages()[0].payload,
            json!({"event": "Page Viewed", "properties": {"distinct_id": "foo", "Path": "/hello"}})
                .as_object()
                .cloned()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_bind_distinct_id_before_first_use() {
        let app = app(testing_state());

        let response = app.oneshot(get_request("/bind")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let recording = response.extensions().get::<Recording>().unwrap();
        assert_eq!(recording.messages()[0].payload["$distinct_id"], "bar");
    }

    #[tokio::test]
    async fn test_headers_become_global_event_props() {
        let app = app(testing_state()).layer(middleware::from_fn(set_user));
        let request = axum::http::Request::builder()
            .uri("/hello")
            .header("X-Mixpanel-Title", "Hello page")
            .header("X-Mixpanel-Foo", "bar")
            .body(Body::empty())
            .unwrap();

        let (logs, _guard) = capture_logs();
        let response = app.oneshot(request).await.unwrap();

        let recording = response.extensions().get::<Recording>().unwrap();
        assert_eq!(
            recording.messages()[0].payload["properties"],
            json!({"distinct_id": "foo", "Title": "Hello page", "Path": "/hello"})
        );
        assert!(logs.has_event(
            Level::WARN,
            "Property 'foo', from request header 'x-mixpanel-foo' is not a member of event_properties"
        ));
    }

    #[tokio::test]
    async fn test_unused_track_is_neither_built_nor_flushed() {
        let (state, counters) = counting_state(ConsumerKind::Buffered);
        assert_eq!(counters.built.load(Ordering::SeqCst), 1);

        let response = app(state.clone()).oneshot(get_request("/bye")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(counters.built.load(Ordering::SeqCst), 1);
        assert_eq!(counters.flushed.load(Ordering::SeqCst), 0);

        let app = app(state).layer(middleware::from_fn(set_user));
        app.oneshot(get_request("/hello")).await.unwrap();
        assert_eq!(counters.built.load(Ordering::SeqCst), 2);
        assert_eq!(counters.flushed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_consumer_is_not_flushed() {
        let (state, counters) = counting_state(ConsumerKind::Queued);
        let app = app(state).layer(middleware::from_fn(set_user));

        app.oneshot(get_request("/hello")).await.unwrap();

        assert_eq!(counters.built.load(Ordering::SeqCst), 2);
        assert_eq!(counters.flushed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_with_reports_missing_distinct_id() {
        let mixpanel = RequestMixpanel::new(testing_state(), None, Vec::new());
        assert!(!mixpanel.is_initialized());

        let result = mixpanel.with(|track| track.track(&Events::PAGE_VIEWED, Properties::new()));
        assert!(matches!(result, Err(TrackError::DistinctIdRequired)));
        assert!(mixpanel.is_initialized());
    }

    #[test]
    fn test_with_reuses_track() {
        let mixpanel = RequestMixpanel::new(testing_state(), Some("foo".into()), Vec::new());

        mixpanel
            .with(|track| track.track(&Events::PAGE_VIEWED, Properties::new()))
            .unwrap();
        mixpanel
            .with(|track| track.track(&Events::USER_LOGGED_IN, Properties::new()))
            .unwrap();

        let recording = mixpanel.with(|track| Ok(track.recording())).unwrap().unwrap();
        assert_eq!(recording.len(), 2);
    }
}
