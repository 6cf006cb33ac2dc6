use anyhow::Result;
use nalgebra::DVector;

use crate::engine::{CallbackStatus, EngineCallbacks};
use crate::system::{Stage, State, System};

/// Adapts a [`System`] to the engine's flat-vector callback protocol.
///
/// Every callback writes the candidate `(t, y)` into a private scratch
/// snapshot, realizes it to the stage the requested quantity needs, and
/// copies the derived vector out. The engine probes speculative candidates
/// freely; none of them touch the authoritative advanced state, which the
/// step controller commits separately.
///
/// Failures raised while realizing are converted to
/// [`CallbackStatus::RecoverableError`] at the callback's outer edge and
/// never cross it.
pub struct SystemBridge<'a, S: System> {
    system: &'a S,
    scratch: State,
    constraint_tolerance: f64,
}

impl<'a, S: System> SystemBridge<'a, S> {
    /// `scratch` should be a copy of the advanced state so the discrete
    /// content and component counts match what the engine is stepping.
    pub fn new(system: &'a S, scratch: State, constraint_tolerance: f64) -> Self {
        Self {
            system,
            scratch,
            constraint_tolerance,
        }
    }

    fn load(&mut self, t: f64, y: &DVector<f64>) {
        self.scratch.set_y(y.clone());
        self.scratch.set_time(t);
    }
}

impl<S: System> EngineCallbacks for SystemBridge<'_, S> {
    fn ode(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> CallbackStatus {
        self.load(t, y);
        if self
            .system
            .realize(&mut self.scratch, Stage::Acceleration)
            .is_err()
        {
            return CallbackStatus::RecoverableError;
        }
        ydot.copy_from(self.scratch.ydot());
        CallbackStatus::Success
    }

    fn constraint(&mut self, t: f64, y: &DVector<f64>, yerr: &mut DVector<f64>) -> CallbackStatus {
        self.load(t, y);
        if self
            .system
            .realize(&mut self.scratch, Stage::Velocity)
            .is_err()
        {
            return CallbackStatus::RecoverableError;
        }
        yerr.copy_from(self.scratch.yerr());
        CallbackStatus::Success
    }

    fn project(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ycorr: &mut DVector<f64>,
        _eps_proj: f64,
        err: &mut DVector<f64>,
    ) -> CallbackStatus {
        self.load(t, y);
        // The projection tolerance in use comes from the integrator's
        // configuration, not from the engine's request.
        let tolerance = self.constraint_tolerance;
        let outcome: Result<()> = (|| {
            self.system.realize(&mut self.scratch, Stage::Position)?;
            let mut y_unit_weights = DVector::zeros(y.len());
            let mut yerr_unit_tolerances = DVector::zeros(self.scratch.constraint_count());
            self.system
                .calc_y_unit_weights(&self.scratch, &mut y_unit_weights);
            self.system
                .calc_yerr_unit_tolerances(&self.scratch, &mut yerr_unit_tolerances);
            self.system.project(
                &mut self.scratch,
                tolerance,
                &y_unit_weights,
                &yerr_unit_tolerances,
                err,
            )
        })();
        if outcome.is_err() {
            return CallbackStatus::RecoverableError;
        }
        *ycorr = self.scratch.y() - y;
        CallbackStatus::Success
    }

    fn root(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        _ydot: &DVector<f64>,
        gout: &mut DVector<f64>,
    ) -> CallbackStatus {
        self.load(t, y);
        if self
            .system
            .realize(&mut self.scratch, Stage::Acceleration)
            .is_err()
        {
            return CallbackStatus::RecoverableError;
        }
        gout.copy_from(self.scratch.triggers());
        CallbackStatus::Success
    }
}
