//! Typed hook bus: the extension points of the period loop.
//!
//! Every lifecycle event the scheduler fires has its own [`HookList`] with a
//! fixed, compile-time-checked handler signature. Handlers are kept in
//! descending priority order; handlers with equal priority fire in
//! registration order.
//!
//! # Dispatch
//!
//! The scheduler snapshots a list before invoking it, so a handler may
//! register or remove other handlers while running. The change takes
//! effect on the next dispatch.
//!
//! A handler that returns an error does not stop the loop: the failure is
//! logged with its event and key, recorded, and dispatch continues with the
//! next handler. Events marked fatal (by default only
//! [`EventKind::ModelPreSetup`]) abort the run instead.
//!
//! Most events run every handler. [`EventKind::DecideBreed`] is
//! first-result: dispatch stops at the first handler that names a breed.
//! [`EventKind::StopCondition`] stops the run if any handler returns `true`.

use std::collections::BTreeSet;
use std::sync::Arc;

use tessera_types::{EntityId, Stage};

use crate::model::Model;

/// Errors raised by hook registration.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// A handler with this key is already registered for the event.
    #[error("hook key {key} is already registered for {event}")]
    DuplicateKey {
        /// The event the registration targeted.
        event: EventKind,
        /// The clashing key.
        key: HookKey,
    },
}

// ---------------------------------------------------------------------------
// Event Kinds
// ---------------------------------------------------------------------------

/// The fixed vocabulary of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// Before any entity exists. Fatal by default.
    ModelPreSetup,
    /// After the initial population has been created.
    ModelPostSetup,
    /// Once per new entity, after it joined its primitive.
    AgentInit,
    /// Once per live entity per stage.
    AgentStep,
    /// Before an entity is removed.
    AgentDie,
    /// After an offspring has been created and initialized.
    AgentReproduce,
    /// Chooses a breed for a new entity. First result wins.
    DecideBreed,
    /// Start of every period.
    ModelPreStep,
    /// Once per stage, before the entities of that stage step.
    ModelStep,
    /// End of every period, after shocks and data collection.
    ModelPostStep,
    /// The loop starts or resumes.
    ModelStart,
    /// The loop halted in a resumable state.
    ModelStop,
    /// Checked at period boundaries; any `true` stops the run.
    StopCondition,
    /// The run is being terminated.
    Terminate,
}

impl EventKind {
    /// Every event, in lifecycle order.
    pub const ALL: [Self; 14] = [
        Self::ModelPreSetup,
        Self::ModelPostSetup,
        Self::AgentInit,
        Self::AgentStep,
        Self::AgentDie,
        Self::AgentReproduce,
        Self::DecideBreed,
        Self::ModelPreStep,
        Self::ModelStep,
        Self::ModelPostStep,
        Self::ModelStart,
        Self::ModelStop,
        Self::StopCondition,
        Self::Terminate,
    ];

    /// Stable snake-case name used in logs and auto-generated keys.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ModelPreSetup => "model_pre_setup",
            Self::ModelPostSetup => "model_post_setup",
            Self::AgentInit => "agent_init",
            Self::AgentStep => "agent_step",
            Self::AgentDie => "agent_die",
            Self::AgentReproduce => "agent_reproduce",
            Self::DecideBreed => "decide_breed",
            Self::ModelPreStep => "model_pre_step",
            Self::ModelStep => "model_step",
            Self::ModelPostStep => "model_post_step",
            Self::ModelStart => "model_start",
            Self::ModelStop => "model_stop",
            Self::StopCondition => "stop_condition",
            Self::Terminate => "terminate",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Keys and Options
// ---------------------------------------------------------------------------

/// Unique key of a registration within one event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookKey(String);

impl HookKey {
    /// Return the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for HookKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HookKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

/// Registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookOptions {
    /// Higher priorities fire first. Default 0.
    pub priority: i32,
    /// Explicit key. Generated as `<event>#<n>` when absent.
    pub key: Option<String>,
    /// Restrict an entity event to one primitive. Ignored by model events.
    pub primitive: Option<String>,
}

impl HookOptions {
    /// Options with the given priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Options with an explicit key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Options restricted to one primitive.
    pub fn for_primitive(mut self, primitive: impl Into<String>) -> Self {
        self.primitive = Some(primitive.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Handler Signatures
// ---------------------------------------------------------------------------

/// `model_pre_setup`, `model_post_setup`, `model_pre_step`,
/// `model_post_step`, `model_stop`, `terminate`.
pub type ModelHook = dyn Fn(&mut Model) -> anyhow::Result<()> + Send + Sync;

/// `model_start`. The flag is `true` when resuming a halted run.
pub type StartHook = dyn Fn(&mut Model, bool) -> anyhow::Result<()> + Send + Sync;

/// `model_step`.
pub type StageHook = dyn Fn(&mut Model, Stage) -> anyhow::Result<()> + Send + Sync;

/// `agent_init`, `agent_die`.
pub type EntityHook = dyn Fn(EntityId, &mut Model) -> anyhow::Result<()> + Send + Sync;

/// `agent_step`.
pub type EntityStageHook =
    dyn Fn(EntityId, &mut Model, Stage) -> anyhow::Result<()> + Send + Sync;

/// `agent_reproduce`: parents, child.
pub type ReproduceHook =
    dyn Fn(&[EntityId], EntityId, &mut Model) -> anyhow::Result<()> + Send + Sync;

/// `decide_breed`: primitive, id of the entity being created.
pub type BreedHook =
    dyn Fn(&Model, &str, EntityId) -> anyhow::Result<Option<String>> + Send + Sync;

/// `stop_condition`.
pub type StopHook = dyn Fn(&Model) -> anyhow::Result<bool> + Send + Sync;

// ---------------------------------------------------------------------------
// Hook List
// ---------------------------------------------------------------------------

/// One registration.
struct Registration<F: ?Sized> {
    key: HookKey,
    priority: i32,
    primitive: Option<String>,
    handler: Arc<F>,
}

/// Priority-ordered handlers for one event.
pub struct HookList<F: ?Sized> {
    kind: EventKind,
    entries: Vec<Registration<F>>,
    next_auto: u64,
}

impl<F: ?Sized> HookList<F> {
    /// Create an empty list for `kind`.
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            next_auto: 0,
        }
    }

    /// The event this list serves.
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in dispatch order.
    pub fn keys(&self) -> Vec<HookKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Whether a handler with this key is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key.as_str() == key)
    }

    /// Remove the handler registered under `key`.
    ///
    /// Removing an absent key is a no-op. Returns whether a handler was
    /// removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key.as_str() != key);
        before != self.entries.len()
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Insert a handler at its priority position.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::DuplicateKey`] if an explicit key is taken.
    pub fn insert(&mut self, options: HookOptions, handler: Arc<F>) -> Result<HookKey, HookError> {
        let key = match options.key {
            Some(key) => {
                if self.contains(&key) {
                    return Err(HookError::DuplicateKey {
                        event: self.kind,
                        key: HookKey(key),
                    });
                }
                HookKey(key)
            }
            None => self.auto_key(),
        };

        // Descending priority; equal priorities keep registration order.
        let at = self
            .entries
            .partition_point(|e| e.priority >= options.priority);
        self.entries.insert(
            at,
            Registration {
                key: key.clone(),
                priority: options.priority,
                primitive: options.primitive,
                handler,
            },
        );
        Ok(key)
    }

    /// Handlers applicable to `primitive`, in dispatch order.
    pub(crate) fn snapshot(&self, primitive: Option<&str>) -> Vec<(HookKey, Arc<F>)> {
        self.entries
            .iter()
            .filter(|e| match (e.primitive.as_deref(), primitive) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            })
            .map(|e| (e.key.clone(), Arc::clone(&e.handler)))
            .collect()
    }

    fn auto_key(&mut self) -> HookKey {
        loop {
            let candidate = format!("{}#{}", self.kind, self.next_auto);
            self.next_auto = self.next_auto.saturating_add(1);
            if !self.contains(&candidate) {
                return HookKey(candidate);
            }
        }
    }
}

impl<F: ?Sized> core::fmt::Debug for HookList<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookList")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .finish()
    }
}

/// Generates the typed `register` / `register_with` pair for one handler
/// signature, so closures get their argument types inferred.
macro_rules! impl_register {
    ($alias:ty, ($($arg:ty),*) -> $ret:ty) => {
        impl HookList<$alias> {
            /// Register a handler with priority 0 and a generated key.
            pub fn register<H>(&mut self, handler: H) -> HookKey
            where
                H: Fn($($arg),*) -> anyhow::Result<$ret> + Send + Sync + 'static,
            {
                let key = self.auto_key();
                let options = HookOptions {
                    key: Some(key.0.clone()),
                    ..HookOptions::default()
                };
                // A freshly generated key cannot clash.
                self.insert(options, Arc::new(handler)).unwrap_or(key)
            }

            /// Register a handler with explicit options.
            ///
            /// # Errors
            ///
            /// Returns [`HookError::DuplicateKey`] if the key is taken.
            pub fn register_with<H>(
                &mut self,
                options: HookOptions,
                handler: H,
            ) -> Result<HookKey, HookError>
            where
                H: Fn($($arg),*) -> anyhow::Result<$ret> + Send + Sync + 'static,
            {
                self.insert(options, Arc::new(handler))
            }
        }
    };
}

impl_register!(ModelHook, (&mut Model) -> ());
impl_register!(StartHook, (&mut Model, bool) -> ());
impl_register!(StageHook, (&mut Model, Stage) -> ());
impl_register!(EntityHook, (EntityId, &mut Model) -> ());
impl_register!(EntityStageHook, (EntityId, &mut Model, Stage) -> ());
impl_register!(ReproduceHook, (&[EntityId], EntityId, &mut Model) -> ());
impl_register!(BreedHook, (&Model, &str, EntityId) -> Option<String>);
impl_register!(StopHook, (&Model) -> bool);

// ---------------------------------------------------------------------------
// Hook Registry
// ---------------------------------------------------------------------------

/// All hook lists of a model, one per event.
#[derive(Debug)]
pub struct Hooks {
    /// Before any entity exists.
    pub model_pre_setup: HookList<ModelHook>,
    /// After the initial population exists.
    pub model_post_setup: HookList<ModelHook>,
    /// Per new entity.
    pub agent_init: HookList<EntityHook>,
    /// Per live entity per stage.
    pub agent_step: HookList<EntityStageHook>,
    /// Per entity, before removal.
    pub agent_die: HookList<EntityHook>,
    /// Per offspring.
    pub agent_reproduce: HookList<ReproduceHook>,
    /// Breed choice for new entities.
    pub decide_breed: HookList<BreedHook>,
    /// Start of each period.
    pub model_pre_step: HookList<ModelHook>,
    /// Each stage.
    pub model_step: HookList<StageHook>,
    /// End of each period.
    pub model_post_step: HookList<ModelHook>,
    /// Loop start or resume.
    pub model_start: HookList<StartHook>,
    /// Resumable halt.
    pub model_stop: HookList<ModelHook>,
    /// Period-boundary stop predicates.
    pub stop_condition: HookList<StopHook>,
    /// Run termination.
    pub terminate: HookList<ModelHook>,
    fatal: BTreeSet<EventKind>,
}

impl Hooks {
    /// Create an empty registry. Only `model_pre_setup` is fatal.
    pub fn new() -> Self {
        Self {
            model_pre_setup: HookList::new(EventKind::ModelPreSetup),
            model_post_setup: HookList::new(EventKind::ModelPostSetup),
            agent_init: HookList::new(EventKind::AgentInit),
            agent_step: HookList::new(EventKind::AgentStep),
            agent_die: HookList::new(EventKind::AgentDie),
            agent_reproduce: HookList::new(EventKind::AgentReproduce),
            decide_breed: HookList::new(EventKind::DecideBreed),
            model_pre_step: HookList::new(EventKind::ModelPreStep),
            model_step: HookList::new(EventKind::ModelStep),
            model_post_step: HookList::new(EventKind::ModelPostStep),
            model_start: HookList::new(EventKind::ModelStart),
            model_stop: HookList::new(EventKind::ModelStop),
            stop_condition: HookList::new(EventKind::StopCondition),
            terminate: HookList::new(EventKind::Terminate),
            fatal: BTreeSet::from([EventKind::ModelPreSetup]),
        }
    }

    /// Mark an event as fatal (a failing handler aborts the run) or not.
    pub fn set_fatal(&mut self, kind: EventKind, fatal: bool) {
        if fatal {
            self.fatal.insert(kind);
        } else {
            self.fatal.remove(&kind);
        }
    }

    /// Whether failures of `kind` abort the run.
    pub fn is_fatal(&self, kind: EventKind) -> bool {
        self.fatal.contains(&kind)
    }

    /// Remove a handler by event and key. Idempotent.
    pub fn remove(&mut self, kind: EventKind, key: &str) -> bool {
        match kind {
            EventKind::ModelPreSetup => self.model_pre_setup.remove(key),
            EventKind::ModelPostSetup => self.model_post_setup.remove(key),
            EventKind::AgentInit => self.agent_init.remove(key),
            EventKind::AgentStep => self.agent_step.remove(key),
            EventKind::AgentDie => self.agent_die.remove(key),
            EventKind::AgentReproduce => self.agent_reproduce.remove(key),
            EventKind::DecideBreed => self.decide_breed.remove(key),
            EventKind::ModelPreStep => self.model_pre_step.remove(key),
            EventKind::ModelStep => self.model_step.remove(key),
            EventKind::ModelPostStep => self.model_post_step.remove(key),
            EventKind::ModelStart => self.model_start.remove(key),
            EventKind::ModelStop => self.model_stop.remove(key),
            EventKind::StopCondition => self.stop_condition.remove(key),
            EventKind::Terminate => self.terminate.remove(key),
        }
    }

    /// Total number of registered handlers across all events.
    pub fn len(&self) -> usize {
        EventKind::ALL.iter().map(|kind| self.count(*kind)).sum()
    }

    /// Whether no handler is registered for any event.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of handlers registered for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::ModelPreSetup => self.model_pre_setup.len(),
            EventKind::ModelPostSetup => self.model_post_setup.len(),
            EventKind::AgentInit => self.agent_init.len(),
            EventKind::AgentStep => self.agent_step.len(),
            EventKind::AgentDie => self.agent_die.len(),
            EventKind::AgentReproduce => self.agent_reproduce.len(),
            EventKind::DecideBreed => self.decide_breed.len(),
            EventKind::ModelPreStep => self.model_pre_step.len(),
            EventKind::ModelStep => self.model_step.len(),
            EventKind::ModelPostStep => self.model_post_step.len(),
            EventKind::ModelStart => self.model_start.len(),
            EventKind::ModelStop => self.model_stop.len(),
            EventKind::StopCondition => self.stop_condition.len(),
            EventKind::Terminate => self.terminate.len(),
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn noop(_model: &mut Model) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn priority_descending_ties_in_registration_order() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::ModelPreStep);
        list.register_with(HookOptions::default().with_key("a"), noop)
            .unwrap();
        list.register_with(
            HookOptions::default().with_key("b").with_priority(5),
            noop,
        )
        .unwrap();
        list.register_with(HookOptions::default().with_key("c"), noop)
            .unwrap();
        list.register_with(
            HookOptions::default().with_key("d").with_priority(5),
            noop,
        )
        .unwrap();
        list.register_with(
            HookOptions::default().with_key("e").with_priority(-1),
            noop,
        )
        .unwrap();

        let keys: Vec<String> = list.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "d", "a", "c", "e"]);
    }

    #[test]
    fn duplicate_explicit_key_is_rejected() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::ModelPostStep);
        list.register_with(HookOptions::default().with_key("x"), noop)
            .unwrap();
        let again = list.register_with(HookOptions::default().with_key("x"), noop);
        assert!(matches!(again, Err(HookError::DuplicateKey { .. })));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn auto_keys_are_unique_and_named_after_event() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::Terminate);
        let first = list.register(noop);
        let second = list.register(noop);
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("terminate#"));
    }

    #[test]
    fn auto_key_skips_taken_explicit_key() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::Terminate);
        list.register_with(HookOptions::default().with_key("terminate#0"), noop)
            .unwrap();
        let generated = list.register(noop);
        assert_ne!(generated.as_str(), "terminate#0");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::ModelStop);
        let key = list.register(noop);
        assert!(list.remove(key.as_str()));
        assert!(!list.remove(key.as_str()));
        assert!(!list.remove("never-registered"));
        assert!(list.is_empty());
    }

    #[test]
    fn survivors_keep_order_after_interleaved_removal() {
        let mut list: HookList<ModelHook> = HookList::new(EventKind::ModelPreStep);
        for (key, priority) in [("a", 1), ("b", 3), ("c", 1), ("d", 3), ("e", 2)] {
            list.register_with(
                HookOptions::default().with_key(key).with_priority(priority),
                noop,
            )
            .unwrap();
        }
        list.remove("d");
        list.remove("a");
        list.register_with(
            HookOptions::default().with_key("f").with_priority(1),
            noop,
        )
        .unwrap();

        let keys: Vec<String> = list.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["b", "e", "c", "f"]);
    }

    #[test]
    fn primitive_filter_applies_to_snapshots() {
        let mut list: HookList<EntityHook> = HookList::new(EventKind::AgentInit);
        list.register_with(HookOptions::default().with_key("all"), |_, _| Ok(()))
            .unwrap();
        list.register_with(
            HookOptions::default().with_key("patch").for_primitive("patch"),
            |_, _| Ok(()),
        )
        .unwrap();

        assert_eq!(list.snapshot(Some("agent")).len(), 1);
        assert_eq!(list.snapshot(Some("patch")).len(), 2);
    }

    #[test]
    fn registry_fatal_defaults() {
        let mut hooks = Hooks::new();
        assert!(hooks.is_fatal(EventKind::ModelPreSetup));
        assert!(!hooks.is_fatal(EventKind::AgentStep));
        hooks.set_fatal(EventKind::AgentStep, true);
        assert!(hooks.is_fatal(EventKind::AgentStep));
        hooks.set_fatal(EventKind::ModelPreSetup, false);
        assert!(!hooks.is_fatal(EventKind::ModelPreSetup));
    }

    #[test]
    fn registry_remove_by_kind() {
        let mut hooks = Hooks::new();
        let key = hooks.model_step.register(|_, _| Ok(()));
        assert_eq!(hooks.count(EventKind::ModelStep), 1);
        assert!(hooks.remove(EventKind::ModelStep, key.as_str()));
        assert!(!hooks.remove(EventKind::ModelStep, key.as_str()));
        assert!(hooks.is_empty());
    }
}
