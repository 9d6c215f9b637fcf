//! Filter chain evaluated by virtual consumers.
//!
//! A chain is an ordered, labelled set of predicate sequences. The firehose
//! consumer carries one entry per active sideline request; replay consumers
//! carry a single entry holding the negated steps of the request they replay.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{SpoutError, SpoutResult};
use crate::message::Message;
use crate::sideline::SidelineRequestIdentifier;

/// One predicate in a filter chain.
///
/// Returning `true` from [`FilterChainStep::filter`] means the message matches
/// the filter and is dropped by the evaluating consumer.
///
/// Implementations define their own equality via [`FilterChainStep::step_eq`];
/// [`FilterChain::find_label`] depends on it to locate the request a given step
/// list belongs to.
pub trait FilterChainStep: fmt::Debug + Send + Sync {
    /// Evaluate the message. `true` means drop.
    fn filter(&self, message: &Message) -> bool;

    /// Value equality against another step.
    fn step_eq(&self, other: &dyn FilterChainStep) -> bool;

    /// Downcast support for [`FilterChainStep::step_eq`] implementations.
    fn as_any(&self) -> &dyn Any;

    /// The serializable form stored inside a sideline payload.
    fn persisted(&self) -> PersistedStep;
}

/// Compare two step sequences by value.
pub fn steps_eq(a: &[Arc<dyn FilterChainStep>], b: &[Arc<dyn FilterChainStep>]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.step_eq(y.as_ref()))
}

/// Serialized form of a step: a registered name plus its configuration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStep {
    pub name: String,
    pub config: Value,
    #[serde(default)]
    pub negated: bool,
}

type StepFactory = fn(&Value) -> SpoutResult<Arc<dyn FilterChainStep>>;

/// Registry of revivable step implementations, keyed by name.
///
/// An explicitly constructed value threaded through the sideline controller;
/// plugin steps register here at startup before any recovery runs.
#[derive(Clone)]
pub struct FilterStepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl fmt::Debug for FilterStepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterStepRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FilterStepRegistry {
    /// A registry holding the built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(StaticMessageFilter::NAME, |config| {
            let filter: StaticMessageFilter = serde_json::from_value(config.clone())?;
            Ok(Arc::new(filter))
        });
        registry.register(FieldEqualsFilter::NAME, |config| {
            let filter: FieldEqualsFilter = serde_json::from_value(config.clone())?;
            Ok(Arc::new(filter))
        });
        registry
    }

    /// Register a step implementation under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, factory: StepFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Revive a persisted step, re-wrapping negation when flagged.
    pub fn revive(&self, persisted: &PersistedStep) -> SpoutResult<Arc<dyn FilterChainStep>> {
        let factory = self.factories.get(&persisted.name).ok_or_else(|| {
            SpoutError::Persistence(format!(
                "no filter step registered under name '{}'",
                persisted.name
            ))
        })?;
        let step = factory(&persisted.config)?;
        if persisted.negated {
            Ok(Arc::new(NegatingFilterChainStep::new(step)))
        } else {
            Ok(step)
        }
    }

    /// Revive a whole persisted step sequence.
    pub fn revive_all(
        &self,
        persisted: &[PersistedStep],
    ) -> SpoutResult<Vec<Arc<dyn FilterChainStep>>> {
        persisted.iter().map(|step| self.revive(step)).collect()
    }
}

/// Ordered, labelled filter chain.
///
/// Mutations are serialized externally (the controller holds a write lock);
/// [`FilterChain::test`] only reads.
#[derive(Debug, Default)]
pub struct FilterChain {
    entries: Vec<(SidelineRequestIdentifier, Vec<Arc<dyn FilterChainStep>>)>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `steps` under `label`, keeping insertion order.
    ///
    /// A duplicate label replaces its previous steps in place.
    pub fn add_steps(
        &mut self,
        label: SidelineRequestIdentifier,
        steps: Vec<Arc<dyn FilterChainStep>>,
    ) {
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == label) {
            warn!(%label, "filter chain already has this label, replacing steps");
            entry.1 = steps;
            return;
        }
        self.entries.push((label, steps));
    }

    /// Detach and return the steps stored under `label`.
    pub fn remove_steps(
        &mut self,
        label: &SidelineRequestIdentifier,
    ) -> Option<Vec<Arc<dyn FilterChainStep>>> {
        let index = self.entries.iter().position(|(id, _)| id == label)?;
        Some(self.entries.remove(index).1)
    }

    /// First label whose step list equals `steps` by value.
    pub fn find_label(
        &self,
        steps: &[Arc<dyn FilterChainStep>],
    ) -> Option<SidelineRequestIdentifier> {
        self.entries
            .iter()
            .find(|(_, existing)| steps_eq(existing, steps))
            .map(|(id, _)| id.clone())
    }

    /// The steps stored under `label`, if any.
    pub fn steps(&self, label: &SidelineRequestIdentifier) -> Option<&[Arc<dyn FilterChainStep>]> {
        self.entries
            .iter()
            .find(|(id, _)| id == label)
            .map(|(_, steps)| steps.as_slice())
    }

    pub fn has_label(&self, label: &SidelineRequestIdentifier) -> bool {
        self.entries.iter().any(|(id, _)| id == label)
    }

    /// Labels in insertion order.
    pub fn labels(&self) -> Vec<SidelineRequestIdentifier> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pass `message` through every step of every entry.
    ///
    /// `true` means some step matched and the message must be dropped.
    pub fn test(&self, message: &Message) -> bool {
        self.entries
            .iter()
            .flat_map(|(_, steps)| steps.iter())
            .any(|step| step.filter(message))
    }
}

/// Inverts the verdict of the wrapped step.
///
/// Replay consumers use this to emit exactly the messages the original request
/// diverted. Never persisted by the controller; the persisted form always
/// carries the original step with `negated` flipped.
#[derive(Debug, Clone)]
pub struct NegatingFilterChainStep {
    inner: Arc<dyn FilterChainStep>,
}

impl NegatingFilterChainStep {
    pub fn new(inner: Arc<dyn FilterChainStep>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn FilterChainStep> {
        &self.inner
    }
}

impl FilterChainStep for NegatingFilterChainStep {
    fn filter(&self, message: &Message) -> bool {
        !self.inner.filter(message)
    }

    fn step_eq(&self, other: &dyn FilterChainStep) -> bool {
        other
            .as_any()
            .downcast_ref::<NegatingFilterChainStep>()
            .map(|other| self.inner.step_eq(other.inner.as_ref()))
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn persisted(&self) -> PersistedStep {
        let mut persisted = self.inner.persisted();
        persisted.negated = !persisted.negated;
        persisted
    }
}

/// A constant-verdict step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticMessageFilter {
    pub verdict: bool,
}

impl StaticMessageFilter {
    pub const NAME: &'static str = "static";

    /// A step that drops everything.
    pub fn drop_all() -> Self {
        Self { verdict: true }
    }

    /// A step that passes everything.
    pub fn pass_all() -> Self {
        Self { verdict: false }
    }
}

impl FilterChainStep for StaticMessageFilter {
    fn filter(&self, _message: &Message) -> bool {
        self.verdict
    }

    fn step_eq(&self, other: &dyn FilterChainStep) -> bool {
        other
            .as_any()
            .downcast_ref::<StaticMessageFilter>()
            .map(|other| self == other)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn persisted(&self) -> PersistedStep {
        PersistedStep {
            name: Self::NAME.to_string(),
            config: json!({ "verdict": self.verdict }),
            negated: false,
        }
    }
}

/// Drops messages carrying a JSON object value whose `field` equals `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEqualsFilter {
    pub field: String,
    pub value: Value,
}

impl FieldEqualsFilter {
    pub const NAME: &'static str = "field-equals";

    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

impl FilterChainStep for FieldEqualsFilter {
    fn filter(&self, message: &Message) -> bool {
        message.values().iter().any(|value| {
            value
                .as_object()
                .and_then(|object| object.get(&self.field))
                .map(|found| *found == self.value)
                .unwrap_or(false)
        })
    }

    fn step_eq(&self, other: &dyn FilterChainStep) -> bool {
        other
            .as_any()
            .downcast_ref::<FieldEqualsFilter>()
            .map(|other| self == other)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn persisted(&self) -> PersistedStep {
        PersistedStep {
            name: Self::NAME.to_string(),
            config: json!({ "field": self.field, "value": self.value }),
            negated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, VirtualConsumerId};
    use serde_json::json;

    fn message_with(value: Value) -> Message {
        Message::new(
            MessageId::new("topic", 0, 1, VirtualConsumerId::from("vc")),
            vec![value],
        )
    }

    #[test]
    fn chain_add_remove_and_order() {
        let mut chain = FilterChain::new();
        let first = SidelineRequestIdentifier::new();
        let second = SidelineRequestIdentifier::new();

        chain.add_steps(
            first.clone(),
            vec![Arc::new(StaticMessageFilter::drop_all())],
        );
        chain.add_steps(
            second.clone(),
            vec![Arc::new(StaticMessageFilter::pass_all())],
        );

        assert_eq!(chain.labels(), vec![first.clone(), second.clone()]);

        let removed = chain.remove_steps(&first).expect("steps present");
        assert_eq!(removed.len(), 1);
        assert!(!chain.has_label(&first));
        assert!(chain.has_label(&second));
    }

    #[test]
    fn find_label_uses_step_equality() {
        let mut chain = FilterChain::new();
        let label = SidelineRequestIdentifier::new();
        chain.add_steps(
            label.clone(),
            vec![Arc::new(FieldEqualsFilter::new("tenant", json!("acme")))],
        );

        // A fresh, value-equal step list locates the label.
        let probe: Vec<Arc<dyn FilterChainStep>> =
            vec![Arc::new(FieldEqualsFilter::new("tenant", json!("acme")))];
        assert_eq!(chain.find_label(&probe), Some(label));

        let other: Vec<Arc<dyn FilterChainStep>> =
            vec![Arc::new(FieldEqualsFilter::new("tenant", json!("zenith")))];
        assert_eq!(chain.find_label(&other), None);
    }

    #[test]
    fn test_drops_when_any_step_matches() {
        let mut chain = FilterChain::new();
        chain.add_steps(
            SidelineRequestIdentifier::new(),
            vec![
                Arc::new(StaticMessageFilter::pass_all()),
                Arc::new(FieldEqualsFilter::new("level", json!("debug"))),
            ],
        );

        assert!(chain.test(&message_with(json!({ "level": "debug" }))));
        assert!(!chain.test(&message_with(json!({ "level": "error" }))));
    }

    #[test]
    fn negation_inverts_and_compares() {
        let inner: Arc<dyn FilterChainStep> =
            Arc::new(FieldEqualsFilter::new("tenant", json!("acme")));
        let negated = NegatingFilterChainStep::new(inner.clone());

        let matching = message_with(json!({ "tenant": "acme" }));
        let other = message_with(json!({ "tenant": "zenith" }));

        assert!(inner.filter(&matching));
        assert!(!negated.filter(&matching));
        assert!(negated.filter(&other));

        let twin = NegatingFilterChainStep::new(Arc::new(FieldEqualsFilter::new(
            "tenant",
            json!("acme"),
        )));
        assert!(negated.step_eq(&twin));
        assert!(!negated.step_eq(inner.as_ref()));
    }

    #[test]
    fn registry_revives_persisted_steps() {
        let registry = FilterStepRegistry::with_builtins();
        let original = FieldEqualsFilter::new("env", json!("staging"));

        let revived = registry.revive(&original.persisted()).unwrap();
        assert!(revived.step_eq(&original));

        // A negated persisted form comes back wrapped.
        let negated = NegatingFilterChainStep::new(Arc::new(original.clone()));
        let revived = registry.revive(&negated.persisted()).unwrap();
        assert!(revived.step_eq(&negated));
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let registry = FilterStepRegistry::with_builtins();
        let persisted = PersistedStep {
            name: "no-such-step".into(),
            config: json!({}),
            negated: false,
        };
        assert!(registry.revive(&persisted).is_err());
    }
}
