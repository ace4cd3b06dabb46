//! Event abstractions.
//!
//! An event kind is defined once, through [`EventKind::define`] or
//! [`EventKindBuilder`], and the definition validates its type before any
//! event of that kind can be constructed. Events are immutable payload
//! wrappers dispatched by an [`EventDispatcher`](crate::dispatcher::EventDispatcher).
//!
//! Event types may be namespaced, e.g. `spam.ham.eggs`; they become the
//! routing key on the source service's topic exchange.

use std::fmt;

use serde::Serialize;

use crate::error::{ConfigurationError, MAX_EVENT_TYPE_LEN};

/// A validated event type (non-empty, at most 255 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventType(String);

impl EventType {
    /// Validates `event_type` on behalf of the kind named `kind`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::EventTypeMissing` if the type is empty and
    /// `ConfigurationError::EventTypeTooLong` if it exceeds 255 bytes.
    pub fn parse(kind: &str, event_type: &str) -> Result<Self, ConfigurationError> {
        if event_type.is_empty() {
            return Err(ConfigurationError::EventTypeMissing {
                kind: kind.to_owned(),
            });
        }
        if event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(ConfigurationError::EventTypeTooLong {
                event_type: event_type.to_owned(),
            });
        }
        Ok(Self(event_type.to_owned()))
    }

    /// Returns the type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated event kind definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKind {
    name: String,
    event_type: EventType,
}

impl EventKind {
    /// Defines an event kind named `name` with the given `event_type`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::EventTypeMissing` when `event_type` is
    /// `None` or empty, and `ConfigurationError::EventTypeTooLong` when it is
    /// longer than 255 bytes.
    pub fn define(name: &str, event_type: Option<&str>) -> Result<Self, ConfigurationError> {
        let event_type = event_type.ok_or_else(|| ConfigurationError::EventTypeMissing {
            kind: name.to_owned(),
        })?;
        Ok(Self {
            name: name.to_owned(),
            event_type: EventType::parse(name, event_type)?,
        })
    }

    /// Starts a builder for an event kind named `name`.
    #[must_use]
    pub fn builder(name: &str) -> EventKindBuilder {
        EventKindBuilder {
            name: name.to_owned(),
            event_type: None,
        }
    }

    /// Returns the kind's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind's event type.
    #[must_use]
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Constructs an event of this kind carrying `data`.
    #[must_use]
    pub fn event(&self, data: serde_json::Value) -> Event {
        Event {
            event_type: self.event_type.clone(),
            data,
        }
    }
}

/// Builder for [`EventKind`].
#[derive(Debug, Clone)]
pub struct EventKindBuilder {
    name: String,
    event_type: Option<String>,
}

impl EventKindBuilder {
    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Validates and returns the event kind.
    ///
    /// # Errors
    ///
    /// See [`EventKind::define`].
    pub fn build(self) -> Result<EventKind, ConfigurationError> {
        EventKind::define(&self.name, self.event_type.as_deref())
    }
}

/// An immutable event ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_type: EventType,
    data: serde_json::Value,
}

impl Event {
    /// Returns the event type, used as the routing key.
    #[must_use]
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Returns the event payload.
    #[must_use]
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Consumes the event, returning its payload.
    #[must_use]
    pub fn into_data(self) -> serde_json::Value {
        self.data
    }
}

/// Trait for statically typed events.
///
/// ```
/// use hopline_core::event::TypedEvent;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct SpamEmitted { ham: String }
///
/// impl TypedEvent for SpamEmitted {
///     const KIND: &'static str = "SpamEmitted";
///     const EVENT_TYPE: &'static str = "spam.ham";
/// }
///
/// assert_eq!(SpamEmitted::kind().unwrap().event_type().as_str(), "spam.ham");
/// ```
///
/// The event type is checked when the type is used, so an invalid one fails
/// the build:
///
/// ```compile_fail
/// use hopline_core::event::TypedEvent;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Nameless;
///
/// impl TypedEvent for Nameless {
///     const KIND: &'static str = "Nameless";
///     const EVENT_TYPE: &'static str = "";
/// }
///
/// let _ = Nameless::kind();
/// ```
pub trait TypedEvent: Serialize {
    /// Name of the event kind, reported in configuration errors.
    const KIND: &'static str;

    /// The event type (routing key).
    const EVENT_TYPE: &'static str;

    /// Evaluates to `()` for a non-empty event type of at most
    /// [`MAX_EVENT_TYPE_LEN`] bytes, and fails compilation otherwise.
    #[doc(hidden)]
    const VALID_EVENT_TYPE: () = assert!(
        !Self::EVENT_TYPE.is_empty() && Self::EVENT_TYPE.len() <= MAX_EVENT_TYPE_LEN,
        "TypedEvent::EVENT_TYPE must be 1 to 255 bytes long"
    );

    /// Returns this type's kind definition.
    ///
    /// # Errors
    ///
    /// See [`EventKind::define`]. The event type is already validated at
    /// compile time, so this does not fail in practice.
    fn kind() -> Result<EventKind, ConfigurationError> {
        let () = Self::VALID_EVENT_TYPE;
        EventKind::define(Self::KIND, Some(Self::EVENT_TYPE))
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Greeting {
        name: String,
    }

    impl TypedEvent for Greeting {
        const KIND: &'static str = "Greeting";
        const EVENT_TYPE: &'static str = "greeting.said";
    }

    #[test]
    fn test_define_without_type_fails_with_event_type_missing() {
        let result = EventKind::define("Nameless", None);

        assert_eq!(
            result,
            Err(ConfigurationError::EventTypeMissing {
                kind: "Nameless".to_owned()
            })
        );
    }

    #[test]
    fn test_builder_without_type_fails_with_event_type_missing() {
        let result = EventKind::builder("Nameless").build();

        assert!(matches!(
            result,
            Err(ConfigurationError::EventTypeMissing { kind }) if kind == "Nameless"
        ));
    }

    #[test]
    fn test_empty_type_is_treated_as_missing() {
        assert!(matches!(
            EventKind::define("Untyped", Some("")),
            Err(ConfigurationError::EventTypeMissing { .. })
        ));
    }

    #[test]
    fn test_type_longer_than_255_bytes_fails_with_event_type_too_long() {
        let long_type = "x".repeat(256);

        let result = EventKind::define("Verbose", Some(&long_type));

        assert_eq!(
            result,
            Err(ConfigurationError::EventTypeTooLong {
                event_type: long_type
            })
        );
    }

    #[test]
    fn test_type_of_exactly_255_bytes_is_accepted() {
        let event_type = "x".repeat(255);

        let kind = EventKind::define("Edge", Some(&event_type)).unwrap();

        assert_eq!(kind.event_type().as_str(), event_type);
    }

    #[test]
    fn test_length_is_measured_in_bytes_not_chars() {
        // 128 two-byte characters.
        let event_type = "é".repeat(128);

        let result = EventKind::define("Accented", Some(&event_type));

        assert!(matches!(
            result,
            Err(ConfigurationError::EventTypeTooLong { .. })
        ));
    }

    #[test]
    fn test_kind_constructs_events_with_its_type_and_data() {
        let kind = EventKind::builder("Spam")
            .event_type("spam.ham.eggs")
            .build()
            .unwrap();

        let event = kind.event(json!({"ham": "eggs"}));

        assert_eq!(event.event_type().as_str(), "spam.ham.eggs");
        assert_eq!(event.data(), &json!({"ham": "eggs"}));
    }

    #[test]
    fn test_typed_event_kind_is_validated() {
        let kind = Greeting::kind().unwrap();
        let greeting = Greeting {
            name: "ferris".to_owned(),
        };

        let event = kind.event(serde_json::to_value(&greeting).unwrap());

        assert_eq!(kind.name(), "Greeting");
        assert_eq!(event.event_type().to_string(), "greeting.said");
        assert_eq!(event.into_data(), json!({"name": "ferris"}));
    }

    #[test]
    fn test_valid_typed_event_passes_const_check() {
        let () = Greeting::VALID_EVENT_TYPE;

        assert_eq!(Greeting::EVENT_TYPE.len(), 13);
    }
}
