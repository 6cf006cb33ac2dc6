use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a single engine callback.
///
/// The callback protocol reserves a fatal code, but this adapter never
/// produces it: any failure raised while realizing a snapshot is reported as
/// recoverable, and the engine's own retry logic (smaller step, fresh
/// iterate) is the only recovery mechanism for that class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Success,
    RecoverableError,
}

/// The reciprocal interface the engine invokes while stepping.
///
/// All callbacks take a candidate `(t, y)` pair. The engine is free to probe
/// several candidates before accepting a step, so implementations must not
/// let a probe leak into any authoritative state.
pub trait EngineCallbacks {
    /// Computes `ydot = f(t, y)`.
    fn ode(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> CallbackStatus;

    /// Computes the constraint residual `yerr = c(t, y)`.
    fn constraint(&mut self, t: f64, y: &DVector<f64>, yerr: &mut DVector<f64>) -> CallbackStatus;

    /// Projects `(t, y)` onto the constraint manifold. On success `ycorr`
    /// holds the correction (projected minus original `y`) and `err` has
    /// been adjusted if the projection touched the error estimate.
    /// `eps_proj` is the engine's requested weighted-norm accuracy.
    fn project(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ycorr: &mut DVector<f64>,
        eps_proj: f64,
        err: &mut DVector<f64>,
    ) -> CallbackStatus;

    /// Computes the event-trigger (root) functions `gout = g(t, y)`.
    fn root(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ydot: &DVector<f64>,
        gout: &mut DVector<f64>,
    ) -> CallbackStatus;
}

/// The raw result of an engine step, resolved from the engine's integer
/// codes exactly once at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The step was accepted and no boundary was hit.
    Success,
    /// The configured stop time was reached.
    StopTimeReached,
    /// One or more root functions crossed zero.
    RootFound,
    /// The internal step budget ran out before the target time. Resumable.
    StepLimitReached,
    /// Any other failure, carrying the engine's diagnostic code.
    Failure(i32),
}

impl StepResult {
    /// Resolves a raw integer return code. Follows the conventional
    /// multistep-engine numbering: 0 success, 1 stop-time return, 2 root
    /// return, -1 step budget exhausted, anything else a failure.
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => StepResult::Success,
            1 => StepResult::StopTimeReached,
            2 => StepResult::RootFound,
            -1 => StepResult::StepLimitReached,
            other => StepResult::Failure(other),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepResult::Failure(_))
    }
}

/// How a single `step` call should advance.
///
/// The two axes are independent: return after every accepted internal step
/// vs. only at the target time, and enforce a hard stop time vs. none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Normal,
    OneStep,
    NormalWithStop,
    OneStepWithStop,
}

/// The engine's linear-multistep family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Bdf,
    Adams,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Bdf => "BDF",
            Method::Adams => "Adams",
        }
    }

    pub fn min_order(&self) -> usize {
        1
    }

    pub fn max_order(&self) -> usize {
        match self {
            Method::Bdf => 5,
            Method::Adams => 12,
        }
    }
}

/// Nonlinear-iteration strategy used inside each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationType {
    Newton,
    Functional,
}

/// Scalar relative/absolute tolerance pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tolerances {
    pub relative: f64,
    pub absolute: f64,
}

/// The engine refused to (re)initialize.
#[derive(Debug, Error)]
#[error("engine rejected initialization (code {code})")]
pub struct InitRejected {
    pub code: i32,
}

/// The external ODE engine, consumed as a black box.
///
/// The engine owns its numerical history (multistep memory, error control,
/// root brackets) but no simulation state; it sees the simulation only
/// through the [`EngineCallbacks`] passed into `init`, `reinit`, and `step`.
pub trait Engine {
    /// Discards all internal history and selects the stepping method and
    /// iteration strategy for the next `init`.
    fn reset(&mut self, method: Method, iteration: IterationType);

    /// Seeds the engine with an initial `(t, y, ydot)` triple.
    fn init(
        &mut self,
        callbacks: &mut dyn EngineCallbacks,
        t0: f64,
        y0: &DVector<f64>,
        ydot0: &DVector<f64>,
        tolerances: Tolerances,
    ) -> Result<(), InitRejected>;

    /// Re-seeds the engine from the given triple, keeping configuration but
    /// discarding multistep history.
    fn reinit(
        &mut self,
        callbacks: &mut dyn EngineCallbacks,
        t: f64,
        y: &DVector<f64>,
        ydot: &DVector<f64>,
        tolerances: Tolerances,
    ) -> Result<(), InitRejected>;

    fn set_initial_step(&mut self, h0: f64);
    fn set_min_step(&mut self, hmin: f64);
    fn set_max_step(&mut self, hmax: f64);
    fn set_stop_time(&mut self, tstop: f64);
    fn set_max_internal_steps(&mut self, limit: usize);
    fn set_projection_frequency(&mut self, every_n_steps: usize);
    fn set_nonlinear_convergence_coef(&mut self, coef: f64);

    /// Selects a dense direct linear solver sized to the state dimension.
    fn use_dense_linear_solver(&mut self, ny: usize);

    /// Enables the engine's built-in nonlinear manifold projection with the
    /// given weighted-norm tolerance.
    fn init_internal_projection(&mut self, tolerance: f64);

    /// Sizes the dense linear solve used by the built-in projection.
    fn use_dense_projection(&mut self, nc: usize, ny: usize);

    /// Declares that projection is handled through the `project` callback
    /// instead of the engine's built-in machinery.
    fn use_caller_projection(&mut self);

    /// Registers the number of root (event-trigger) functions to track.
    fn init_roots(&mut self, n: usize);

    /// Advances toward `t_out` in the given mode. Writes the accepted
    /// continuous state and derivative into `y` and `ydot` and returns the
    /// time actually reached together with the resolved step result.
    fn step(
        &mut self,
        callbacks: &mut dyn EngineCallbacks,
        t_out: f64,
        mode: StepMode,
        y: &mut DVector<f64>,
        ydot: &mut DVector<f64>,
    ) -> (f64, StepResult);

    /// Dense-output query: evaluates the interpolating polynomial at `t`,
    /// which must lie within the last accepted step interval.
    fn interpolate(&self, t: f64, y: &mut DVector<f64>);

    /// After a root return, reports which registered root functions fired.
    fn root_info(&self, fired: &mut [bool]);

    fn actual_initial_step(&self) -> f64;
    fn last_step(&self) -> f64;
    fn current_step(&self) -> f64;

    fn num_steps(&self) -> u64;
    fn num_error_test_failures(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_resolve_to_the_closed_set() {
        assert_eq!(StepResult::from_raw(0), StepResult::Success);
        assert_eq!(StepResult::from_raw(1), StepResult::StopTimeReached);
        assert_eq!(StepResult::from_raw(2), StepResult::RootFound);
        assert_eq!(StepResult::from_raw(-1), StepResult::StepLimitReached);
        assert_eq!(StepResult::from_raw(-4), StepResult::Failure(-4));
        assert_eq!(StepResult::from_raw(3), StepResult::Failure(3));
    }

    #[test]
    fn only_failure_codes_are_failures() {
        assert!(!StepResult::Success.is_failure());
        assert!(!StepResult::StepLimitReached.is_failure());
        assert!(StepResult::Failure(-2).is_failure());
    }

    #[test]
    fn method_metadata() {
        assert_eq!(Method::Bdf.name(), "BDF");
        assert_eq!(Method::Adams.name(), "Adams");
        assert_eq!(Method::Bdf.min_order(), 1);
        assert_eq!(Method::Bdf.max_order(), 5);
        assert_eq!(Method::Adams.max_order(), 12);
    }
}
