use anyhow::Result;
use nalgebra::DVector;

/// Computation stages a [`State`] can be realized to, in order.
///
/// Derived quantities become readable once the snapshot has been realized to
/// a high enough stage: constraint errors at `Velocity`, derivatives and
/// event triggers at `Acceleration`. Writing to the continuous state or the
/// time lowers the stage again, so stale derived values can never be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Empty,
    Model,
    Time,
    Position,
    Velocity,
    Dynamics,
    Acceleration,
    Report,
}

/// A snapshot of the simulated system.
///
/// Owns the time, the continuous-state vector `y`, and any discrete content
/// that the stepping machinery carries along but never integrates. Derived
/// vectors (`ydot`, constraint errors, event triggers) are caches filled in
/// by [`System::realize`]; reading them below the stage that computes them
/// is a bug in the caller.
#[derive(Debug, Clone)]
pub struct State {
    time: f64,
    y: DVector<f64>,
    discrete: Vec<f64>,
    stage: Stage,
    ydot: DVector<f64>,
    yerr: DVector<f64>,
    triggers: DVector<f64>,
}

impl State {
    /// Creates a snapshot at `time` with continuous state `y` and no
    /// constraint or event-trigger components.
    pub fn new(time: f64, y: DVector<f64>) -> Self {
        let ny = y.len();
        Self {
            time,
            y,
            discrete: Vec::new(),
            stage: Stage::Model,
            ydot: DVector::zeros(ny),
            yerr: DVector::zeros(0),
            triggers: DVector::zeros(0),
        }
    }

    /// Creates a snapshot with `nc` constraint-error components and `ne`
    /// event-trigger components.
    pub fn with_counts(time: f64, y: DVector<f64>, nc: usize, ne: usize) -> Self {
        let mut state = Self::new(time, y);
        state.set_constraint_count(nc);
        state.set_trigger_count(ne);
        state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn discrete(&self) -> &[f64] {
        &self.discrete
    }

    pub fn discrete_mut(&mut self) -> &mut Vec<f64> {
        &mut self.discrete
    }

    /// Overwrites the continuous state, invalidating everything that was
    /// computed from it.
    pub fn set_y(&mut self, y: DVector<f64>) {
        self.y = y;
        self.invalidate(Stage::Time);
    }

    /// Overwrites the time, invalidating time-dependent results.
    pub fn set_time(&mut self, time: f64) {
        self.time = time;
        self.invalidate(Stage::Model);
    }

    /// Lowers the realized stage to at most `stage`.
    pub fn invalidate(&mut self, stage: Stage) {
        if self.stage > stage {
            self.stage = stage;
        }
    }

    /// Number of constraint-error components.
    pub fn constraint_count(&self) -> usize {
        self.yerr.len()
    }

    /// Number of event-trigger components.
    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn set_constraint_count(&mut self, nc: usize) {
        self.yerr = DVector::zeros(nc);
        self.invalidate(Stage::Model);
    }

    pub fn set_trigger_count(&mut self, ne: usize) {
        self.triggers = DVector::zeros(ne);
        self.invalidate(Stage::Model);
    }

    /// The derivative vector. Valid once realized to `Acceleration`.
    pub fn ydot(&self) -> &DVector<f64> {
        debug_assert!(
            self.stage >= Stage::Acceleration,
            "ydot read below Acceleration stage"
        );
        &self.ydot
    }

    /// The constraint-error vector. Valid once realized to `Velocity`.
    pub fn yerr(&self) -> &DVector<f64> {
        debug_assert!(
            self.stage >= Stage::Velocity,
            "yerr read below Velocity stage"
        );
        &self.yerr
    }

    /// The event-trigger vector. Valid once realized to `Acceleration`.
    pub fn triggers(&self) -> &DVector<f64> {
        debug_assert!(
            self.stage >= Stage::Acceleration,
            "triggers read below Acceleration stage"
        );
        &self.triggers
    }

    // Mutable access for `System::realize` implementations.

    pub fn ydot_mut(&mut self) -> &mut DVector<f64> {
        &mut self.ydot
    }

    pub fn yerr_mut(&mut self) -> &mut DVector<f64> {
        &mut self.yerr
    }

    pub fn triggers_mut(&mut self) -> &mut DVector<f64> {
        &mut self.triggers
    }

    /// Marks the snapshot as realized to `stage`. Called by
    /// [`System::realize`] after the corresponding caches are filled.
    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }
}

/// The simulated system the stepping machinery drives.
///
/// Implementations own the physics; the integrator only ever talks to them
/// through snapshots. `realize` must be idempotent: realizing a snapshot
/// that is already at (or beyond) the requested stage is a no-op.
pub trait System {
    /// Brings `state` up to `stage`, filling the derived-vector caches the
    /// stage makes available. May fail for numerically bad states; such
    /// failures are recoverable from the engine's point of view.
    fn realize(&self, state: &mut State, stage: Stage) -> Result<()>;

    /// Unit weights for the continuous-state components, used to express
    /// projection accuracy as a weighted norm. `state` must be realized to
    /// `Position`.
    fn calc_y_unit_weights(&self, state: &State, weights: &mut DVector<f64>);

    /// Unit tolerances for the constraint-error components. `state` must be
    /// realized to `Position`.
    fn calc_yerr_unit_tolerances(&self, state: &State, tolerances: &mut DVector<f64>);

    /// Projects `state` onto the constraint manifold to within `accuracy`
    /// (a weighted-norm tolerance), optionally removing the component of
    /// `error_estimate` normal to the manifold.
    fn project(
        &self,
        state: &mut State,
        accuracy: f64,
        y_unit_weights: &DVector<f64>,
        yerr_unit_tolerances: &DVector<f64>,
        error_estimate: &mut DVector<f64>,
    ) -> Result<()>;

    /// Maps raw trigger indices reported by the engine to caller-visible
    /// event ids. The default keeps them as-is; systems with their own event
    /// numbering filter and remap here.
    fn identify_triggered_events(&self, trigger_indices: &[usize]) -> Vec<usize> {
        trigger_indices.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Empty < Stage::Model);
        assert!(Stage::Model < Stage::Position);
        assert!(Stage::Velocity < Stage::Acceleration);
        assert!(Stage::Acceleration < Stage::Report);
    }

    #[test]
    fn writing_y_invalidates_derived_results() {
        let mut state = State::new(0.0, DVector::from_vec(vec![1.0, 2.0]));
        state.set_stage(Stage::Acceleration);
        state.set_y(DVector::from_vec(vec![3.0, 4.0]));
        assert_eq!(state.stage(), Stage::Time);
    }

    #[test]
    fn writing_time_invalidates_time_dependent_results() {
        let mut state = State::new(0.0, DVector::from_vec(vec![1.0]));
        state.set_stage(Stage::Report);
        state.set_time(1.5);
        assert_eq!(state.stage(), Stage::Model);
        assert_eq!(state.time(), 1.5);
    }

    #[test]
    fn invalidate_never_raises_the_stage() {
        let mut state = State::new(0.0, DVector::from_vec(vec![1.0]));
        assert_eq!(state.stage(), Stage::Model);
        state.invalidate(Stage::Acceleration);
        assert_eq!(state.stage(), Stage::Model);
    }

    #[test]
    fn component_counts_are_resizable() {
        let mut state = State::new(0.0, DVector::from_vec(vec![1.0, 2.0, 3.0]));
        assert_eq!(state.constraint_count(), 0);
        assert_eq!(state.trigger_count(), 0);
        state.set_constraint_count(2);
        state.set_trigger_count(4);
        assert_eq!(state.constraint_count(), 2);
        assert_eq!(state.trigger_count(), 4);
    }

    #[test]
    fn discrete_content_survives_clone() {
        let mut state = State::new(0.0, DVector::from_vec(vec![1.0]));
        state.discrete_mut().extend_from_slice(&[7.0, 8.0]);
        let copy = state.clone();
        assert_eq!(copy.discrete(), &[7.0, 8.0]);
    }
}
