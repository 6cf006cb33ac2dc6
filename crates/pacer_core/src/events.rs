use serde::{Deserialize, Serialize};

/// How a trigger function crossed zero.
///
/// Root returns from the engine do not distinguish crossing directions, so
/// every member of an [`EventSet`] carries `AnySignChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTransition {
    AnySignChange,
}

/// One triggered event: the caller-visible id, the time the engine localized
/// the root to, and the transition classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggeredEvent {
    pub id: usize,
    pub time: f64,
    pub transition: EventTransition,
}

/// The set of events triggered within one step window.
///
/// Built fresh on every root return and replaced on the next; never
/// persisted across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    /// Start of the step the roots were localized in.
    pub window_start: f64,
    /// Time the engine returned, which is where every root is reported.
    pub window_end: f64,
    pub events: Vec<TriggeredEvent>,
}
