use serde::Serialize;

/// A domain event that knows its own routing key.
///
/// The name is an associated constant so handlers can be registered by type
/// without an instance at hand. Events that take part in tag-based routing
/// override [`tags`](Event::tags); each tag becomes a `tag.<name>` header
/// when the event is written to the outbox.
///
/// ```rust
/// use outbox_broker::Event;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct UserCreated {
///     user_id: String,
/// }
///
/// impl Event for UserCreated {
///     const NAME: &'static str = "user.created";
///
///     fn tags(&self) -> &[&'static str] {
///         &["profile"]
///     }
/// }
/// ```
pub trait Event: Serialize + Send + Sync {
    /// Routing key of the event.
    const NAME: &'static str;

    fn event_name(&self) -> &'static str {
        Self::NAME
    }

    /// Tags used for header-based routing. None by default.
    fn tags(&self) -> &[&'static str] {
        &[]
    }
}
