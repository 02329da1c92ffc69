//! Builder for FSM specifications.

use std::sync::Arc;

use crate::machine::{Event, EventKind, Feature, Flow, FsmSpec, Machine, State, StateSpec};
use crate::state::StateData;

/// Fluent constructor for [`FsmSpec`] values.
///
/// Combinators use this internally; it is public so callers can declare
/// bespoke machines that still compose with `merge`, `timeout`, and
/// `operate`.
#[derive(Default)]
pub struct SpecBuilder {
    spec: FsmSpec,
}

impl SpecBuilder {
    /// Start an empty specification.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the specification's name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    /// Set the initial state.
    pub fn initial(mut self, state: State) -> Self {
        self.spec.initial = Some(state);
        self
    }

    /// Declare valid outgoing transitions for a state.
    pub fn transitions(mut self, from: State, to: impl IntoIterator<Item = State>) -> Self {
        let slot = self.state_mut(from);
        slot.transitions.extend(to);
        self
    }

    /// Append an entry hook for a state. Hooks merged from several
    /// specifications chain with guard semantics.
    pub fn on_enter<F>(mut self, state: State, hook: F) -> Self
    where
        F: Fn(&Machine, &mut StateData) -> Flow + Send + Sync + 'static,
    {
        self.state_mut(state).on_enter.push(Arc::new(hook));
        self
    }

    /// Append an exit hook for a state.
    pub fn on_exit<F>(mut self, state: State, hook: F) -> Self
    where
        F: Fn(&Machine, &mut StateData) -> Flow + Send + Sync + 'static,
    {
        self.state_mut(state).on_exit.push(Arc::new(hook));
        self
    }

    /// Set the handler for an event kind in a state.
    pub fn handle<F>(mut self, state: State, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&Machine, &mut StateData, &Event) -> Flow + Send + Sync + 'static,
    {
        self.state_mut(state).handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Declare a feature flag.
    pub fn feature(mut self, feature: Feature) -> Self {
        if !self.spec.features.contains(&feature) {
            self.spec.features.push(feature);
        }
        self
    }

    /// Finish the specification.
    pub fn build(self) -> FsmSpec {
        self.spec
    }

    fn state_mut(&mut self, state: State) -> &mut StateSpec {
        self.spec.states.entry(state).or_default()
    }
}
