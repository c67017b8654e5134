//! Payload validation.
//!
//! Payload types describe their own constraints by implementing [`Validate`].
//! The [`Validator`] is constructed explicitly and handed to the broker, the
//! consumer group and the event router, so there is no process-wide validation
//! state.

use tracing_error::SpanTrace;

/// Constraints of a payload type.
///
/// Implementations record every broken rule into `violations`; they never
/// return early on the first one unless the validator asks for it.
pub trait Validate {
    fn validate(&self, violations: &mut Violations);
}

impl Validate for serde_json::Value {
    fn validate(&self, _violations: &mut Violations) {}
}

impl Validate for String {
    fn validate(&self, _violations: &mut Violations) {}
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self, violations: &mut Violations) {
        if let Some(value) = self {
            value.validate(violations);
        }
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self, violations: &mut Violations) {
        for value in self {
            value.validate(violations);
        }
    }
}

/// A single broken constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// Collector of broken constraints handed to [`Validate::validate`].
#[derive(Debug, Default)]
pub struct Violations {
    items: Vec<Violation>,
    limit: Option<usize>,
}

impl Violations {
    fn with_limit(limit: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            limit,
        }
    }

    /// Record a violation if `ok` is false.
    pub fn check(&mut self, field: &str, ok: bool, message: &str) -> &mut Self {
        if !ok && !self.is_full() {
            self.items.push(Violation {
                field: field.to_owned(),
                message: message.to_owned(),
            });
        }
        self
    }

    /// The field must not be empty or whitespace only.
    pub fn required(&mut self, field: &str, value: &str) -> &mut Self {
        self.check(field, !value.trim().is_empty(), "is required")
    }

    /// The field must look like an e-mail address.
    pub fn email(&mut self, field: &str, value: &str) -> &mut Self {
        let ok = match value.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            }
            None => false,
        };
        self.check(field, ok, "must be a valid email address")
    }

    /// The field length, in characters, must be within `min..=max`.
    pub fn length(&mut self, field: &str, value: &str, min: usize, max: usize) -> &mut Self {
        let len = value.chars().count();
        self.check(
            field,
            (min..=max).contains(&len),
            &format!("length must be between {min} and {max}"),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.items.len() >= limit)
    }
}

/// Validation component injected wherever payloads cross the messaging
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    fail_fast: bool,
}

impl Validator {
    /// A validator that reports every violation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop recording after the first violation.
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    /// Check `value` against its constraints.
    pub fn validate<T: Validate + ?Sized>(&self, value: &T) -> Result<(), ValidationError> {
        let mut violations = Violations::with_limit(self.fail_fast.then_some(1));
        value.validate(&mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(violations.items))
        }
    }
}

/// Error returned when a payload breaks its constraints.
#[derive(Debug)]
pub struct ValidationError {
    context: SpanTrace,
    violations: Vec<Violation>,
}

impl ValidationError {
    fn new(violations: Vec<Violation>) -> Self {
        Self {
            context: SpanTrace::capture(),
            violations,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed:")?;
        for violation in &self.violations {
            write!(f, " {} {};", violation.field, violation.message)?;
        }
        writeln!(f)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Signup {
        user_id: String,
        email: String,
    }

    impl Validate for Signup {
        fn validate(&self, violations: &mut Violations) {
            violations
                .required("user_id", &self.user_id)
                .email("email", &self.email);
        }
    }

    #[test]
    fn valid_payload_passes() {
        let signup = Signup {
            user_id: "u-1".into(),
            email: "jane@example.com".into(),
        };

        assert!(Validator::new().validate(&signup).is_ok());
    }

    #[test]
    fn every_violation_is_reported() {
        let signup = Signup {
            user_id: " ".into(),
            email: "not-an-email".into(),
        };

        let err = Validator::new().validate(&signup).unwrap_err();
        let fields: Vec<_> = err.violations().iter().map(|v| v.field.as_str()).collect();

        assert_eq!(fields, vec!["user_id", "email"]);
    }

    #[test]
    fn fail_fast_stops_after_first_violation() {
        let signup = Signup {
            user_id: String::new(),
            email: String::new(),
        };

        let err = Validator::new().fail_fast().validate(&signup).unwrap_err();

        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].field, "user_id");
    }

    #[test]
    fn length_rule_counts_characters() {
        let mut violations = Violations::default();
        violations.length("name", "héllo", 1, 5);
        assert!(violations.is_empty());

        violations.length("name", "", 1, 5);
        assert!(!violations.is_empty());
    }
}
