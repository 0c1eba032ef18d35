use std::sync::Arc;

/// Outcome of checking a candidate value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::Valid
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A predicate attached to a field, checked before every write.
pub type Validator<T> = Arc<dyn Fn(&T) -> ValidationResult + Send + Sync>;

/// A write was rejected by the field's validator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value} for {field}: {reason}")]
pub struct ValidationError {
    /// Full key of the field.
    pub field: String,
    /// Debug rendering of the rejected value.
    pub value: String,
    pub reason: String,
}

/// Stock validators.
pub mod validators {
    use std::fmt::Display;
    use std::sync::Arc;

    use super::{ValidationResult, Validator};

    /// Rejects values below the type's zero.
    pub fn non_negative<T>() -> Validator<T>
    where
        T: PartialOrd + Default + 'static,
    {
        Arc::new(|value: &T| {
            if *value >= T::default() {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid("value cannot be negative")
            }
        })
    }

    /// Accepts `min..=max`.
    pub fn range<T>(min: T, max: T) -> Validator<T>
    where
        T: PartialOrd + Display + Send + Sync + 'static,
    {
        Arc::new(move |value: &T| {
            if *value >= min && *value <= max {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid(format!("value must be between {min} and {max}"))
            }
        })
    }

    /// Limits a string to `max` characters.
    pub fn max_length(max: usize) -> Validator<String> {
        Arc::new(move |value: &String| {
            if value.chars().count() <= max {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid(format!("string exceeds max length of {max}"))
            }
        })
    }

    pub fn not_empty() -> Validator<String> {
        Arc::new(|value: &String| {
            if value.trim().is_empty() {
                ValidationResult::invalid("string must not be empty")
            } else {
                ValidationResult::valid()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::validators::*;
    use super::*;

    #[test]
    fn non_negative_accepts_zero() {
        let v = non_negative::<i64>();
        assert!(v(&0).is_valid());
        assert!(v(&12).is_valid());
        assert_eq!(v(&-1), ValidationResult::invalid("value cannot be negative"));
    }

    #[test]
    fn range_is_inclusive() {
        let v = range(1, 10);
        assert!(v(&1).is_valid());
        assert!(v(&10).is_valid());
        assert!(!v(&11).is_valid());
        assert!(!v(&0).is_valid());
    }

    #[test]
    fn max_length_counts_chars() {
        let v = max_length(3);
        assert!(v(&"äöü".to_string()).is_valid());
        assert!(!v(&"abcd".to_string()).is_valid());
    }

    #[test]
    fn not_empty_rejects_whitespace() {
        let v = not_empty();
        assert!(!v(&"  ".to_string()).is_valid());
        assert!(v(&"x".to_string()).is_valid());
    }

    #[test]
    fn error_message_names_field() {
        let err = ValidationError {
            field: "economy:coins".into(),
            value: "-5".into(),
            reason: "value cannot be negative".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value -5 for economy:coins: value cannot be negative"
        );
    }
}
