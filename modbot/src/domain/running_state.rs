//! Running-state machines for a managed community.

use serde::{Deserialize, Serialize};

/// Operational state of one facet (manager, events or queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Paused,
    #[default]
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who requested a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausedBy {
    #[default]
    System,
    User,
}

impl CausedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for CausedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying a transition to a [`StateEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same state requested by the same causer; nothing happened.
    Unchanged,
    /// Same state, but the causer was updated.
    CauserChanged { previous: CausedBy },
    /// The state itself changed.
    Changed { from: RunState },
}

impl Transition {
    /// Whether observers should be told about this transition.
    pub fn should_notify(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: RunState,
    pub caused_by: CausedBy,
}

impl StateEntry {
    pub fn new(state: RunState, caused_by: CausedBy) -> Self {
        Self { state, caused_by }
    }

    /// Move to `state`, recording who asked for it.
    pub fn transition(&mut self, state: RunState, caused_by: CausedBy) -> Transition {
        if self.state == state {
            if self.caused_by == caused_by {
                return Transition::Unchanged;
            }
            let previous = self.caused_by;
            self.caused_by = caused_by;
            return Transition::CauserChanged { previous };
        }

        let from = self.state;
        self.state = state;
        self.caused_by = caused_by;
        Transition::Changed { from }
    }
}

/// Which part of a community's lifecycle a state refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Manager,
    Events,
    Queue,
}

impl Facet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Events => "events",
            Self::Queue => "queue",
        }
    }
}

impl std::fmt::Display for Facet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The {manager, events, queue} triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunningStates {
    pub manager: StateEntry,
    pub events: StateEntry,
    pub queue: StateEntry,
}

impl RunningStates {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn get(&self, facet: Facet) -> &StateEntry {
        match facet {
            Facet::Manager => &self.manager,
            Facet::Events => &self.events,
            Facet::Queue => &self.queue,
        }
    }

    pub fn get_mut(&mut self, facet: Facet) -> &mut StateEntry {
        match facet {
            Facet::Manager => &mut self.manager,
            Facet::Events => &mut self.events,
            Facet::Queue => &mut self.queue,
        }
    }
}
