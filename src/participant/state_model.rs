//! State model definitions and per-edge transition handlers.
//!
//! A definition names the legal states and transition edges; a model binds
//! one handler per edge. Handlers are registered in an explicit edge table
//! rather than looked up by naming convention, built once when the model is
//! created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::TransitionResult;
use crate::constants::{states, ONLINE_OFFLINE};
use crate::manager::NotificationContext;
use crate::model::{Message, State};

/// The legal states and transition edges of one model type.
#[derive(Debug, Clone)]
pub struct StateModelDef {
    name: String,
    initial: State,
    states: Vec<State>,
    transitions: HashSet<(State, State)>,
}

impl StateModelDef {
    pub fn new(name: impl Into<String>, initial: State) -> Self {
        Self {
            name: name.into(),
            states: vec![initial.clone()],
            initial,
            transitions: HashSet::new(),
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    pub fn with_transition(mut self, from: State, to: State) -> Self {
        self = self.with_state(from.clone()).with_state(to.clone());
        self.transitions.insert((from, to));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &State {
        &self.initial
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn has_transition(&self, from: &State, to: &State) -> bool {
        self.transitions
            .contains(&(from.clone(), to.clone()))
    }

    /// First hop on the shortest legal path from `from` to `to`, or `None`
    /// when `to` is unreachable. The controller walks desired-state changes
    /// one edge at a time, so multi-hop targets (e.g. ONLINE -> DROPPED via
    /// OFFLINE) converge over successive messages.
    pub fn next_state_on_path(&self, from: &State, to: &State) -> Option<State> {
        if from == to {
            return None;
        }
        if self.has_transition(from, to) {
            return Some(to.clone());
        }
        // BFS over the edge set, tracking the first hop that reached each
        // visited state.
        let mut visited: HashMap<State, State> = HashMap::new();
        let mut queue: VecDeque<State> = VecDeque::new();
        for (edge_from, edge_to) in &self.transitions {
            if edge_from == from {
                visited.insert(edge_to.clone(), edge_to.clone());
                queue.push_back(edge_to.clone());
            }
        }
        while let Some(state) = queue.pop_front() {
            if &state == to {
                return visited.get(&state).cloned();
            }
            let first_hop = visited.get(&state).cloned()?;
            for (edge_from, edge_to) in &self.transitions {
                if edge_from == &state && !visited.contains_key(edge_to) {
                    visited.insert(edge_to.clone(), first_hop.clone());
                    queue.push_back(edge_to.clone());
                }
            }
        }
        None
    }

    /// The built-in OnlineOffline model: OFFLINE/ONLINE/DROPPED plus ERROR
    /// recovery edges the controller uses to reset failed replicas.
    pub fn online_offline() -> Arc<Self> {
        let offline = State::new(states::OFFLINE);
        let online = State::new(states::ONLINE);
        let dropped = State::new(states::DROPPED);
        let error = State::new(states::ERROR);
        Arc::new(
            Self::new(ONLINE_OFFLINE, offline.clone())
                .with_transition(offline.clone(), online.clone())
                .with_transition(online.clone(), offline.clone())
                .with_transition(offline.clone(), dropped.clone())
                .with_transition(error.clone(), offline)
                .with_transition(error, dropped),
        )
    }
}

/// Application code run on one transition edge. Raising an error moves the
/// replica to ERROR; recovery is a later controller decision.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn run(&self, message: Message, context: NotificationContext) -> TransitionResult<()>;
}

/// Adapter turning an async closure into a [`TransitionHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TransitionHandler for FnHandler<F>
where
    F: Fn(Message, NotificationContext) -> Fut + Send + Sync,
    Fut: Future<Output = TransitionResult<()>> + Send,
{
    async fn run(&self, message: Message, context: NotificationContext) -> TransitionResult<()> {
        (self.f)(message, context).await
    }
}

/// One state model: a definition plus the handler table keyed by edge.
pub struct StateModel {
    def: Arc<StateModelDef>,
    handlers: HashMap<(State, State), Arc<dyn TransitionHandler>>,
}

impl StateModel {
    pub fn builder(def: Arc<StateModelDef>) -> StateModelBuilder {
        StateModelBuilder {
            def,
            handlers: HashMap::new(),
        }
    }

    pub fn def(&self) -> &Arc<StateModelDef> {
        &self.def
    }

    pub fn handler_for(&self, from: &State, to: &State) -> Option<&Arc<dyn TransitionHandler>> {
        self.handlers.get(&(from.clone(), to.clone()))
    }
}

pub struct StateModelBuilder {
    def: Arc<StateModelDef>,
    handlers: HashMap<(State, State), Arc<dyn TransitionHandler>>,
}

impl StateModelBuilder {
    /// Register a handler for the edge `from -> to`.
    pub fn on(
        mut self,
        from: impl Into<State>,
        to: impl Into<State>,
        handler: Arc<dyn TransitionHandler>,
    ) -> Self {
        self.handlers.insert((from.into(), to.into()), handler);
        self
    }

    /// Register an async closure for the edge `from -> to`.
    pub fn on_fn<F, Fut>(self, from: impl Into<State>, to: impl Into<State>, f: F) -> Self
    where
        F: Fn(Message, NotificationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransitionResult<()>> + Send + 'static,
    {
        let handler: Arc<dyn TransitionHandler> = Arc::new(FnHandler::new(f));
        self.on(from, to, handler)
    }

    pub fn build(self) -> StateModel {
        StateModel {
            def: self.def,
            handlers: self.handlers,
        }
    }
}
