//! Validation messages and validators.
//!
//! Two kinds of validators exist:
//!
//! - Per-property validators look at one value synchronously.
//! - [`CrossValidator`]s read any number of properties and may be
//!   asynchronous. Their results are cached per validator instance by the
//!   engine; identity is the instance, not its shape, so two validators built
//!   from the same closure are tracked separately.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::graph::PropertyId;

/// Severity of a validation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Error,
    Warning,
    Info,
    /// The validator itself failed.
    ErrorThrownDuringValidation,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub kind: ValidationKind,
    pub text: String,
}

impl ValidationMessage {
    pub fn new(kind: ValidationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(ValidationKind::Error, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(ValidationKind::Warning, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(ValidationKind::Info, text)
    }

    /// Message reported in place of a validator that failed.
    pub fn thrown(error: &dyn fmt::Display) -> Self {
        Self::new(ValidationKind::ErrorThrownDuringValidation, error.to_string())
    }

    pub(crate) fn required() -> Self {
        Self::error("a value is required")
    }

    /// Whether the message makes its property invalid.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            ValidationKind::Error | ValidationKind::ErrorThrownDuringValidation
        )
    }
}

/// Synchronous validator of a single value.
pub type Validator<T> = Arc<dyn Fn(Option<&T>) -> Option<ValidationMessage> + Send + Sync>;

type CrossRule =
    dyn Fn() -> BoxFuture<'static, Result<Vec<ValidationMessage>, RuleError>> + Send + Sync;

/// Identity of a [`CrossValidator`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidatorId(u64);

impl ValidatorId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A validator spanning several properties.
///
/// Cloning shares the instance (and therefore the cached result).
#[derive(Clone)]
pub struct CrossValidator {
    inner: Arc<CrossValidatorInner>,
}

struct CrossValidatorInner {
    id: ValidatorId,
    inputs: Vec<PropertyId>,
    rule: Box<CrossRule>,
}

impl CrossValidator {
    /// Create an asynchronous validator reading `inputs`.
    pub fn new<I, F, Fut>(inputs: I, rule: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ValidationMessage>, RuleError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CrossValidatorInner {
                id: ValidatorId::new(),
                inputs: inputs.into_iter().map(Into::into).collect(),
                rule: Box::new(move || rule().boxed()),
            }),
        }
    }

    /// Create a synchronous validator reading `inputs`.
    pub fn new_sync<I, F>(inputs: I, rule: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
        F: Fn() -> Result<Vec<ValidationMessage>, RuleError> + Send + Sync + 'static,
    {
        let rule = Arc::new(rule);
        Self::new(inputs, move || {
            let rule = rule.clone();
            async move { rule() }
        })
    }

    pub fn id(&self) -> ValidatorId {
        self.inner.id
    }

    pub fn inputs(&self) -> &[PropertyId] {
        &self.inner.inputs
    }

    /// Run the rule. Errors and panics become a single
    /// [`ValidationKind::ErrorThrownDuringValidation`] message.
    pub(crate) async fn evaluate(&self) -> Vec<ValidationMessage> {
        let pending = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.inner.rule)())) {
            Ok(pending) => pending,
            Err(_) => return vec![ValidationMessage::thrown(&"validator panicked")],
        };
        match AssertUnwindSafe(pending).catch_unwind().await {
            Ok(Ok(messages)) => messages,
            Ok(Err(error)) => vec![ValidationMessage::thrown(&error)],
            Err(_) => vec![ValidationMessage::thrown(&"validator panicked")],
        }
    }
}

impl fmt::Debug for CrossValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossValidator")
            .field("id", &self.inner.id)
            .field("inputs", &self.inner.inputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validators_are_identified_by_instance() {
        let a = CrossValidator::new_sync(["x"], || Ok(Vec::new()));
        let b = CrossValidator::new_sync(["x"], || Ok(Vec::new()));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
        assert_eq!(a.inputs(), &[PropertyId::from("x")]);
    }

    #[tokio::test]
    async fn errors_become_a_thrown_message() {
        let validator = CrossValidator::new_sync(["x"], || Err("backend unreachable".into()));
        let messages = validator.evaluate().await;
        assert_eq!(
            messages,
            vec![ValidationMessage::new(
                ValidationKind::ErrorThrownDuringValidation,
                "backend unreachable"
            )]
        );
        assert!(messages[0].is_error());
    }

    fn explode() -> Result<Vec<ValidationMessage>, RuleError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panics_become_a_thrown_message() {
        let validator = CrossValidator::new(["x"], || async { explode() });
        let messages = validator.evaluate().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, ValidationKind::ErrorThrownDuringValidation);
    }

    #[test]
    fn only_errors_invalidate() {
        assert!(ValidationMessage::error("x").is_error());
        assert!(!ValidationMessage::warning("x").is_error());
        assert!(!ValidationMessage::info("x").is_error());
    }
}
