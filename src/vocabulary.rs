//! Closed vocabularies of events and properties.
//!
//! Different parts of an application tend to send slightly differently named
//! events ("Page Load", "User Visited", "Viewed Page") and properties
//! ("title" vs "name"). Every call into [`Track`](crate::Track) is therefore
//! checked against a [`Vocabulary`]: an ordered table mapping a symbolic key
//! (`page_viewed`) to the display value sent to Mixpanel (`"Page Viewed"`).
//!
//! Four baseline vocabularies ship with the crate. Applications extend them
//! instead of replacing them:
//!
//! ```rust,ignore
//! use mixtrack::{Event, Events};
//!
//! pub struct AppEvents;
//!
//! impl AppEvents {
//!     pub const STATE_CHANGED: Event = Event::new("State Changed");
//! }
//!
//! let events = Events::vocabulary()
//!     .extend("AppEvents", [("state_changed", AppEvents::STATE_CHANGED)]);
//! assert!(events.includes(&Events::vocabulary()));
//! ```

use std::borrow::Cow;
use std::fmt;

/// Marker Mixpanel uses for reserved ("special") property names.
pub const RESERVED_PREFIX: char = '$';

/// A single event that we send to Mixpanel.
///
/// The name is what shows up in Mixpanel, so it should be something nice,
/// like "Page Viewed".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event {
    name: Cow<'static, str>,
}

impl Event {
    /// Declare an event with a static display name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    /// Declare an event whose name is only known at runtime.
    pub fn owned(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
        }
    }

    /// Display name sent to Mixpanel.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A single property attached to events or profiles.
///
/// Some properties are special and carry the [`RESERVED_PREFIX`], e.g.
/// `$email` or `$created`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Property {
    name: Cow<'static, str>,
}

impl Property {
    /// Declare a property with a static display name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    /// Declare a property whose name is only known at runtime.
    pub fn owned(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
        }
    }

    /// Display name sent to Mixpanel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display name with the reserved prefix removed, as customer.io wants it.
    pub fn unprefixed_name(&self) -> &str {
        strip_reserved_prefix(&self.name)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Strip leading reserved-prefix markers from a display name.
pub fn strip_reserved_prefix(name: &str) -> &str {
    name.trim_start_matches(RESERVED_PREFIX)
}

/// The four independent vocabularies a [`Track`](crate::Track) validates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VocabularyKind {
    Events,
    EventProperties,
    ProfileProperties,
    ProfileMetaProperties,
}

impl VocabularyKind {
    /// Name of the baseline vocabulary every override must be based on.
    pub fn base_name(&self) -> &'static str {
        match self {
            Self::Events => "Events",
            Self::EventProperties => "EventProperties",
            Self::ProfileProperties => "ProfileProperties",
            Self::ProfileMetaProperties => "ProfileMetaProperties",
        }
    }

    /// Field name used in logs and error messages (`event_properties`, ...).
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::EventProperties => "event_properties",
            Self::ProfileProperties => "profile_properties",
            Self::ProfileMetaProperties => "profile_meta_properties",
        }
    }
}

impl fmt::Display for VocabularyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_name())
    }
}

/// An immutable, ordered table of allowed entries keyed by symbolic name.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary<T> {
    name: String,
    entries: Vec<(String, T)>,
}

impl<T: Clone + PartialEq> Vocabulary<T> {
    /// Build a vocabulary from scratch.
    ///
    /// Later entries replace earlier ones with the same key.
    pub fn new<K, I>(name: impl Into<String>, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        let mut vocabulary = Self {
            name: name.into(),
            entries: Vec::new(),
        };
        vocabulary.insert_all(entries);
        vocabulary
    }

    /// Derive a new vocabulary from this one with extra entries.
    ///
    /// Redefining an existing key replaces its value, which makes the result
    /// no longer include the original (see [`Vocabulary::includes`]).
    pub fn extend<K, I>(mut self, name: impl Into<String>, entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        self.name = name.into();
        self.insert_all(entries);
        self
    }

    fn insert_all<K, I>(&mut self, entries: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        for (key, value) in entries {
            let key = key.into();
            match self.entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => self.entries.push((key, value)),
            }
        }
    }

    /// Name of this vocabulary, e.g. `EventProperties` or `AppEvents`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an entry by symbolic key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Whether `value` is one of the allowed entries.
    pub fn contains(&self, value: &T) -> bool {
        self.entries.iter().any(|(_, v)| v == value)
    }

    /// Whether every `(key, value)` of `base` is also present here.
    pub fn includes(&self, base: &Vocabulary<T>) -> bool {
        base.entries
            .iter()
            .all(|(key, value)| self.get(key) == Some(value))
    }

    /// Iterate over `(key, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Events we allow sending.
///
/// Page views and clicks are deliberately generic: more specific events are
/// built in the Mixpanel UI by filtering on path and/or title.
pub struct Events;

impl Events {
    pub const PAGE_VIEWED: Event = Event::new("Page Viewed");
    pub const BUTTON_LINK_CLICKED: Event = Event::new("Button/Link Clicked");

    // Account/subscription status
    pub const USER_SIGNED_UP: Event = Event::new("User Signed Up");
    pub const USER_LOGGED_IN: Event = Event::new("User Logged In");
    pub const USER_CHARGED: Event = Event::new("User Charged");
    pub const USER_DISABLED: Event = Event::new("User Disabled");

    /// The baseline events vocabulary.
    pub fn vocabulary() -> Vocabulary<Event> {
        Vocabulary::new(
            VocabularyKind::Events.base_name(),
            [
                ("page_viewed", Self::PAGE_VIEWED),
                ("button_link_clicked", Self::BUTTON_LINK_CLICKED),
                ("user_signed_up", Self::USER_SIGNED_UP),
                ("user_logged_in", Self::USER_LOGGED_IN),
                ("user_charged", Self::USER_CHARGED),
                ("user_disabled", Self::USER_DISABLED),
            ],
        )
    }
}

/// Properties we allow setting on events.
pub struct EventProperties;

impl EventProperties {
    pub const TITLE: Property = Property::new("Title");
    pub const PATH: Property = Property::new("Path");
    /// Referring URL, including your own domain.
    pub const DOLLAR_REFERRER: Property = Property::new("$referrer");

    /// The baseline event properties vocabulary.
    pub fn vocabulary() -> Vocabulary<Property> {
        Vocabulary::new(
            VocabularyKind::EventProperties.base_name(),
            [
                ("title", Self::TITLE),
                ("path", Self::PATH),
                ("dollar_referrer", Self::DOLLAR_REFERRER),
            ],
        )
    }
}

/// Properties we allow setting on profiles.
pub struct ProfileProperties;

impl ProfileProperties {
    /// When the user created their account, as a Mixpanel date string.
    pub const DOLLAR_CREATED: Property = Property::new("$created");
    /// Used by Mixpanel for email messages and gravatar images.
    pub const DOLLAR_EMAIL: Property = Property::new("$email");
    pub const DOLLAR_NAME: Property = Property::new("$name");
    /// Used by Mixpanel for SMS messages, e.g. "4805551212".
    pub const DOLLAR_PHONE: Property = Property::new("$phone");
    /// Any value unsubscribes the user from Mixpanel automated emails.
    pub const DOLLAR_UNSUBSCRIBED: Property = Property::new("$unsubscribed");

    /// The baseline profile properties vocabulary.
    pub fn vocabulary() -> Vocabulary<Property> {
        Vocabulary::new(
            VocabularyKind::ProfileProperties.base_name(),
            [
                ("dollar_created", Self::DOLLAR_CREATED),
                ("dollar_email", Self::DOLLAR_EMAIL),
                ("dollar_name", Self::DOLLAR_NAME),
                ("dollar_phone", Self::DOLLAR_PHONE),
                ("dollar_unsubscribed", Self::DOLLAR_UNSUBSCRIBED),
            ],
        )
    }
}

/// Overrides of how Mixpanel processes a profile update. Rarely needed.
pub struct ProfileMetaProperties;

impl ProfileMetaProperties {
    /// IP used for geo-locating the profile.
    pub const DOLLAR_IP: Property = Property::new("$ip");
    /// Seconds since the epoch. Updates are applied in `$time` order.
    pub const DOLLAR_TIME: Property = Property::new("$time");
    /// Don't bump the profile's "Last Seen".
    pub const DOLLAR_IGNORE_TIME: Property = Property::new("$ignore_time");
    /// Apply the update to this exact distinct_id, not an alias of it.
    pub const DOLLAR_IGNORE_ALIAS: Property = Property::new("$ignore_alias");

    /// The baseline profile meta properties vocabulary.
    pub fn vocabulary() -> Vocabulary<Property> {
        Vocabulary::new(
            VocabularyKind::ProfileMetaProperties.base_name(),
            [
                ("dollar_ip", Self::DOLLAR_IP),
                ("dollar_time", Self::DOLLAR_TIME),
                ("dollar_ignore_time", Self::DOLLAR_IGNORE_TIME),
                ("dollar_ignore_alias", Self::DOLLAR_IGNORE_ALIAS),
            ],
        )
    }
}

/// The baseline property vocabulary for a property kind.
///
/// Returns `None` for [`VocabularyKind::Events`], whose entries are events.
pub fn baseline_properties(kind: VocabularyKind) -> Option<Vocabulary<Property>> {
    match kind {
        VocabularyKind::Events => None,
        VocabularyKind::EventProperties => Some(EventProperties::vocabulary()),
        VocabularyKind::ProfileProperties => Some(ProfileProperties::vocabulary()),
        VocabularyKind::ProfileMetaProperties => Some(ProfileMetaProperties::vocabulary()),
    }
}
