/// Result of a stage that may have fallen back to a default instead of
/// asking the model. Lets strict callers tell "verified and passed" apart
/// from "verifier unavailable, assumed passed".
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Degraded { fallback: T, reason: String },
}

impl<T> Outcome<T> {
    pub fn degraded(fallback: T, reason: impl Into<String>) -> Self {
        Self::Degraded {
            fallback,
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Completed(value) => value,
            Self::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Completed(value) => value,
            Self::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Degraded { reason, .. } => Some(reason.as_str()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::Degraded { fallback, reason } => Outcome::Degraded {
                fallback: f(fallback),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Outcome;

    #[test]
    fn degraded_outcome_still_yields_its_value() {
        let outcome = Outcome::degraded(5, "model timed out");
        assert!(outcome.is_degraded());
        assert_eq!(outcome.degraded_reason(), Some("model timed out"));
        assert_eq!(*outcome.value(), 5);
        assert_eq!(outcome.map(|value| value * 2).into_value(), 10);
    }

    #[test]
    fn completed_outcome_has_no_reason() {
        let outcome = Outcome::Completed("ok");
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.degraded_reason(), None);
    }
}
