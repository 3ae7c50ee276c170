//! Topic-name resolution and validation.
//!
//! A handler's topic is built from an optional class-level fragment and a
//! required method-level fragment. A partial method fragment is joined onto
//! the class fragment with a single dot; otherwise the method fragment is
//! used as is. A configured prefix is prepended last.

use tracing_error::SpanTrace;

/// Longest accepted topic name.
pub const MAX_TOPIC_LEN: usize = 255;

/// One routing fragment declared on a handler or on its owning group of
/// handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAttribute {
    name: String,
    is_partial: bool,
}

impl TopicAttribute {
    /// A complete topic name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_partial: false,
        }
    }

    /// A fragment meant to be joined with its counterpart.
    pub fn partial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_partial: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_partial(&self) -> bool {
        self.is_partial
    }
}

/// Resolve the topic for a handler.
///
/// Pure and deterministic: the same fragments and prefix always give the
/// same topic.
pub fn resolve_topic(
    class: Option<&TopicAttribute>,
    method: &TopicAttribute,
    prefix: Option<&str>,
) -> String {
    let topic = match class {
        Some(class) if method.is_partial() => format!(
            "{}.{}",
            class.name().trim_end_matches('.'),
            method.name().trim_start_matches('.')
        ),
        _ => method.name().to_owned(),
    };

    apply_prefix(prefix, &topic)
}

/// Prepend `prefix` and a dot to `name` when the prefix is non-empty.
pub fn apply_prefix(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{name}"),
        _ => name.to_owned(),
    }
}

/// Check a topic against the naming rules brokers rely on: non-empty, at
/// most [`MAX_TOPIC_LEN`] characters, ASCII alphanumerics plus `.`, `-` and
/// `_`, and no leading, trailing or consecutive dots.
pub fn validate_topic_name(name: &str) -> Result<(), TopicError> {
    if name.is_empty() {
        return Err(TopicError::new(name, TopicErrorKind::Empty));
    }
    if name.len() > MAX_TOPIC_LEN {
        return Err(TopicError::new(name, TopicErrorKind::TooLong(name.len())));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(TopicError::new(name, TopicErrorKind::InvalidCharacter(c)));
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(TopicError::new(name, TopicErrorKind::MisplacedDot));
    }
    Ok(())
}

/// Error returned when a topic name breaks the naming rules.
#[derive(Debug)]
pub struct TopicError {
    context: SpanTrace,
    name: String,
    kind: TopicErrorKind,
}

/// Topic naming violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicErrorKind {
    Empty,
    TooLong(usize),
    InvalidCharacter(char),
    MisplacedDot,
}

impl TopicError {
    fn new(name: &str, kind: TopicErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            name: name.to_owned(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TopicErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TopicErrorKind::Empty => writeln!(f, "Topic name is empty"),
            TopicErrorKind::TooLong(len) => writeln!(
                f,
                "Topic name '{}' is {len} characters long, at most {MAX_TOPIC_LEN} are allowed",
                self.name
            ),
            TopicErrorKind::InvalidCharacter(c) => {
                writeln!(f, "Topic name '{}' contains invalid character '{c}'", self.name)
            }
            TopicErrorKind::MisplacedDot => writeln!(
                f,
                "Topic name '{}' has a leading, trailing or doubled '.'",
                self.name
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TopicError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_fragments_are_joined_and_prefixed() {
        let topic = resolve_topic(
            Some(&TopicAttribute::partial("demo.")),
            &TopicAttribute::partial(".ping"),
            Some("v1"),
        );
        assert_eq!(topic, "v1.demo.ping");
    }

    #[test]
    fn complete_method_fragment_is_used_verbatim() {
        let method = TopicAttribute::new("demo.ping");
        assert_eq!(resolve_topic(None, &method, None), "demo.ping");
        assert_eq!(resolve_topic(None, &method, Some("")), "demo.ping");
        assert_eq!(resolve_topic(None, &method, Some("v1")), "v1.demo.ping");
    }

    #[test]
    fn class_fragment_is_ignored_for_complete_method_fragment() {
        let topic = resolve_topic(
            Some(&TopicAttribute::partial("orders")),
            &TopicAttribute::new("billing.paid"),
            None,
        );
        assert_eq!(topic, "billing.paid");
    }

    #[test]
    fn partial_method_without_class_is_used_verbatim() {
        let topic = resolve_topic(None, &TopicAttribute::partial("ping"), None);
        assert_eq!(topic, "ping");
    }

    #[test]
    fn only_dots_at_the_joint_are_trimmed() {
        let topic = resolve_topic(
            Some(&TopicAttribute::partial("a.b..")),
            &TopicAttribute::partial("..c.d"),
            None,
        );
        assert_eq!(topic, "a.b.c.d");
    }

    #[test]
    fn validates_topic_names() {
        assert!(validate_topic_name("v1.demo.ping").is_ok());
        assert!(validate_topic_name("orders-created_v2").is_ok());

        let kind = |name: &str| validate_topic_name(name).unwrap_err().kind().clone();
        assert_eq!(kind(""), TopicErrorKind::Empty);
        assert_eq!(kind(&"a".repeat(256)), TopicErrorKind::TooLong(256));
        assert_eq!(kind("demo ping"), TopicErrorKind::InvalidCharacter(' '));
        assert_eq!(kind(".demo"), TopicErrorKind::MisplacedDot);
        assert_eq!(kind("demo."), TopicErrorKind::MisplacedDot);
        assert_eq!(kind("demo..ping"), TopicErrorKind::MisplacedDot);
        assert!(validate_topic_name(&"a".repeat(255)).is_ok());
    }
}
