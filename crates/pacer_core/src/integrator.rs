use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::SystemBridge;
use crate::engine::{
    CallbackStatus, Engine, EngineCallbacks, IterationType, Method, StepMode, StepResult,
    Tolerances,
};
use crate::events::{EventSet, EventTransition, TriggeredEvent};
use crate::system::{Stage, State, System};

/// What a single `step_to` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// First call of a new continuous interval; the current state is itself
    /// a trajectory point and no progress was made.
    StartOfContinuousInterval,
    ReachedReportTime,
    ReachedScheduledEvent,
    ReachedEventTrigger,
    /// The internal step budget ran out. Not an error; call again to resume.
    ReachedStepLimit,
    EndOfSimulation,
    /// An internal step was accepted and per-step notification is on.
    TimeHasAdvanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    ReachedFinalTime,
}

/// Fatal integration failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error("integrator initialization failed: {reason}")]
    InitializationFailed { reason: String },
    #[error("engine step failed at t = {time} (code {code})")]
    StepFailed { time: f64, code: i32 },
    #[error("failed to realize state derivatives at t = {time}: {reason}")]
    RealizeFailed { time: f64, reason: anyhow::Error },
}

/// User-facing stepping configuration, pushed into the engine at
/// initialization. `None` leaves the engine's own default in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepperSettings {
    pub initial_step: Option<f64>,
    pub min_step: Option<f64>,
    pub max_step: Option<f64>,
    /// Hard stop time. When set, stepping runs in a with-stop mode and the
    /// engine reports reaching it as end of simulation.
    pub final_time: Option<f64>,
    /// Internal step budget per `step_to` call.
    pub internal_step_limit: Option<usize>,
    /// Ask the engine to project onto the constraint manifold every step.
    pub project_every_step: bool,
    /// Return control to the caller after every accepted internal step.
    pub return_every_internal_step: bool,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    /// Weighted-norm tolerance used for manifold projection.
    pub constraint_tolerance: f64,
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            initial_step: None,
            min_step: None,
            max_step: None,
            final_time: None,
            internal_step_limit: None,
            project_every_step: false,
            return_every_internal_step: false,
            relative_tolerance: 1e-4,
            absolute_tolerance: 1e-8,
            constraint_tolerance: 1e-4,
        }
    }
}

/// Step-size and counter statistics queried from the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Statistics {
    pub actual_initial_step: f64,
    pub last_step: f64,
    pub predicted_next_step: f64,
    pub steps_taken: u64,
    pub error_test_failures: u64,
}

/// A step result the caller was told about before the engine's raw return
/// was fully consumed. The next `step_to` call resumes from here instead of
/// invoking the engine again.
#[derive(Debug, Clone)]
struct Pending {
    result: StepResult,
    t_returned: f64,
    /// Set when the advanced state was rewound to an event boundary; holds
    /// the overshot vector to restore on resume.
    saved_y: Option<DVector<f64>>,
}

/// Drives a [`System`] forward in time with an external multistep [`Engine`],
/// returning control at report times, scheduled event times, detected event
/// triggers, and the configured stop time.
///
/// The integrator owns two snapshots: the advanced state, which only moves
/// forward, and an interpolated state synthesized via the engine's dense
/// output whenever an internal step overshoots the requested ceiling. The
/// caller reads whichever [`state`](Integrator::state) currently designates.
pub struct Integrator<S: System, E: Engine> {
    system: S,
    engine: E,
    method: Method,
    iteration: IterationType,
    settings: StepperSettings,
    engine_projection: bool,
    initialized: bool,
    advanced: Option<State>,
    interpolated: Option<State>,
    use_interpolated: bool,
    pending: Option<Pending>,
    start_of_continuous_interval: bool,
    previous_start_time: f64,
    triggered: Option<EventSet>,
    termination_reason: Option<TerminationReason>,
}

impl<S: System, E: Engine> Integrator<S, E> {
    /// Creates an integrator with the conventional iteration strategy for
    /// the method: functional iteration for Adams, Newton for BDF.
    pub fn new(system: S, engine: E, method: Method, settings: StepperSettings) -> Self {
        let iteration = match method {
            Method::Adams => IterationType::Functional,
            Method::Bdf => IterationType::Newton,
        };
        Self::with_iteration(system, engine, method, iteration, settings)
    }

    pub fn with_iteration(
        system: S,
        mut engine: E,
        method: Method,
        iteration: IterationType,
        settings: StepperSettings,
    ) -> Self {
        engine.reset(method, iteration);
        Self {
            system,
            engine,
            method,
            iteration,
            settings,
            engine_projection: false,
            initialized: false,
            advanced: None,
            interpolated: None,
            use_interpolated: false,
            pending: None,
            start_of_continuous_interval: false,
            previous_start_time: 0.0,
            triggered: None,
            termination_reason: None,
        }
    }

    /// Selects the engine's built-in nonlinear manifold projection instead
    /// of the `project` callback. May only be called before `initialize`.
    pub fn set_use_engine_projection(&mut self) {
        assert!(
            !self.initialized,
            "engine projection may not be selected after the integrator has been initialized"
        );
        self.engine_projection = true;
    }

    /// Seeds the engine from `state` and prepares for stepping.
    ///
    /// The next `step_to` call will return
    /// [`StepStatus::StartOfContinuousInterval`] so the starting state is
    /// visible as a trajectory point.
    pub fn initialize(&mut self, state: State) -> Result<(), IntegratorError> {
        if state.stage() < Stage::Model {
            // The model changed underneath us; rebuild the engine from
            // scratch before seeding it.
            self.engine.reset(self.method, self.iteration);
        }
        self.push_settings();

        let mut advanced = state;
        self.system
            .realize(&mut advanced, Stage::Velocity)
            .map_err(|err| IntegratorError::InitializationFailed {
                reason: format!("failed to realize the initial state: {err}"),
            })?;

        let ny = advanced.y().len();
        let nc = advanced.constraint_count();
        let tolerances = self.tolerances();
        let mut ydot = DVector::zeros(ny);
        {
            let mut bridge = SystemBridge::new(
                &self.system,
                advanced.clone(),
                self.settings.constraint_tolerance,
            );
            if bridge.ode(advanced.time(), advanced.y(), &mut ydot) != CallbackStatus::Success {
                return Err(IntegratorError::InitializationFailed {
                    reason: "failed to compute the initial derivative".to_string(),
                });
            }
            self.engine
                .init(&mut bridge, advanced.time(), advanced.y(), &ydot, tolerances)
                .map_err(|err| IntegratorError::InitializationFailed {
                    reason: err.to_string(),
                })?;
        }
        self.engine.use_dense_linear_solver(ny);
        self.engine.set_nonlinear_convergence_coef(0.01);
        if self.engine_projection {
            self.engine
                .init_internal_projection(self.settings.constraint_tolerance);
            self.engine.use_dense_projection(nc, ny);
        } else {
            self.engine.use_caller_projection();
        }
        self.engine.init_roots(advanced.trigger_count());

        self.previous_start_time = advanced.time();
        self.interpolated = Some(advanced.clone());
        self.advanced = Some(advanced);
        self.use_interpolated = false;
        self.pending = None;
        self.start_of_continuous_interval = true;
        self.triggered = None;
        self.termination_reason = None;
        self.initialized = true;
        Ok(())
    }

    /// Re-seeds the engine from the current advanced state, discarding its
    /// multistep history. A no-op for stages at or above `Report`.
    pub fn reinitialize(&mut self, stage: Stage) -> Result<(), IntegratorError> {
        assert!(self.initialized, "reinitialize called before initialize");
        if stage >= Stage::Report {
            return Ok(());
        }
        self.pending = None;
        let tolerances = self.tolerances();
        let constraint_tolerance = self.settings.constraint_tolerance;
        let advanced = self.advanced.as_mut().expect("initialized");
        let time = advanced.time();
        self.system
            .realize(advanced, Stage::Acceleration)
            .map_err(|err| IntegratorError::RealizeFailed { time, reason: err })?;
        let mut bridge = SystemBridge::new(&self.system, advanced.clone(), constraint_tolerance);
        self.engine
            .reinit(
                &mut bridge,
                advanced.time(),
                advanced.y(),
                advanced.ydot(),
                tolerances,
            )
            .map_err(|err| IntegratorError::InitializationFailed {
                reason: err.to_string(),
            })?;
        Ok(())
    }

    /// Marks the start of a new continuous interval. The next `step_to`
    /// call returns immediately with the current state untouched.
    pub fn mark_interval_start(&mut self) {
        self.start_of_continuous_interval = true;
    }

    /// Advances toward `report_time`, stopping earlier at a scheduled event
    /// time, a detected event trigger, the configured stop time, or the
    /// internal step limit. Returns exactly one outcome per call.
    ///
    /// `report_time` must not precede the time last handed to the caller,
    /// and `scheduled_event_time` must not precede the current state time.
    pub fn step_to(
        &mut self,
        report_time: f64,
        scheduled_event_time: Option<f64>,
    ) -> Result<StepStatus, IntegratorError> {
        assert!(self.initialized, "step_to called before initialize");
        let current_time = self.state().time();
        assert!(
            report_time >= current_time,
            "report time {report_time} precedes the current state time {current_time}"
        );
        if let Some(t) = scheduled_event_time {
            assert!(
                t >= current_time,
                "scheduled event time {t} precedes the current state time {current_time}"
            );
        }

        // The interval's starting state is itself a trajectory point; hand
        // it to the caller before making any progress. A scheduled event
        // coinciding with the interval start is picked up on the next call.
        if self.start_of_continuous_interval {
            self.start_of_continuous_interval = false;
            return Ok(StepStatus::StartOfContinuousInterval);
        }

        let scheduled_event_time = scheduled_event_time.unwrap_or(f64::INFINITY);
        let t_max = report_time.min(scheduled_event_time);
        let mode = match (
            self.settings.final_time.is_some(),
            self.settings.return_every_internal_step,
        ) {
            (true, true) => StepMode::OneStepWithStop,
            (true, false) => StepMode::NormalWithStop,
            (false, true) => StepMode::OneStep,
            (false, false) => StepMode::Normal,
        };

        loop {
            let advanced = self.advanced.as_mut().expect("initialized");
            let (t_ret, result) = match self.pending.take() {
                None => {
                    self.previous_start_time = advanced.time();
                    let ny = advanced.y().len();
                    let mut yout = DVector::zeros(ny);
                    let mut ypout = DVector::zeros(ny); // ignored
                    let mut bridge = SystemBridge::new(
                        &self.system,
                        advanced.clone(),
                        self.settings.constraint_tolerance,
                    );
                    let (t_ret, result) =
                        self.engine.step(&mut bridge, t_max, mode, &mut yout, &mut ypout);
                    advanced.set_y(yout);
                    (t_ret, result)
                }
                Some(pending) => {
                    // The engine already stepped past the boundary we last
                    // reported; restore how things stood after that step.
                    if let Some(saved) = pending.saved_y {
                        advanced.set_y(saved);
                    }
                    (pending.t_returned, pending.result)
                }
            };
            advanced.set_time(t_ret);
            self.system
                .realize(advanced, Stage::Acceleration)
                .map_err(|err| IntegratorError::RealizeFailed {
                    time: t_ret,
                    reason: err,
                })?;

            match result {
                StepResult::StepLimitReached => return Ok(StepStatus::ReachedStepLimit),
                StepResult::Failure(code) => {
                    return Err(IntegratorError::StepFailed { time: t_ret, code })
                }
                _ => {}
            }

            if t_ret > t_max {
                let mut interp = interpolated_at(&self.engine, advanced, t_max);
                self.system
                    .realize(&mut interp, Stage::Acceleration)
                    .map_err(|err| IntegratorError::RealizeFailed {
                        time: t_max,
                        reason: err,
                    })?;
                self.interpolated = Some(interp);
                self.use_interpolated = true;
            } else {
                self.use_interpolated = false;
            }

            // A coincident report and event boundary goes to the report
            // exactly when the report time does not lie past the event.
            if t_ret >= report_time && report_time <= scheduled_event_time {
                self.pending = Some(Pending {
                    result,
                    t_returned: t_ret,
                    saved_y: None,
                });
                return Ok(StepStatus::ReachedReportTime);
            }
            if t_ret >= scheduled_event_time {
                let saved_y = if t_ret > scheduled_event_time {
                    // Rewind the advanced state to the exact boundary; the
                    // overshot vector is kept for the resuming call.
                    let saved = advanced.y().clone();
                    let interp_y = self
                        .interpolated
                        .as_ref()
                        .expect("interpolated state exists after an overshoot")
                        .y()
                        .clone();
                    advanced.set_y(interp_y);
                    advanced.set_time(scheduled_event_time);
                    self.system
                        .realize(advanced, Stage::Acceleration)
                        .map_err(|err| IntegratorError::RealizeFailed {
                            time: scheduled_event_time,
                            reason: err,
                        })?;
                    Some(saved)
                } else {
                    None
                };
                self.pending = Some(Pending {
                    result,
                    t_returned: t_ret,
                    saved_y,
                });
                return Ok(StepStatus::ReachedScheduledEvent);
            }
            if result == StepResult::StopTimeReached {
                self.termination_reason = Some(TerminationReason::ReachedFinalTime);
                return Ok(StepStatus::EndOfSimulation);
            }
            if result == StepResult::RootFound {
                let n = advanced.trigger_count();
                let mut fired = vec![false; n];
                self.engine.root_info(&mut fired);
                let indices: Vec<usize> = fired
                    .iter()
                    .enumerate()
                    .filter_map(|(i, hit)| hit.then_some(i))
                    .collect();
                let ids = self.system.identify_triggered_events(&indices);
                let events = ids
                    .into_iter()
                    .map(|id| TriggeredEvent {
                        id,
                        time: t_ret,
                        transition: EventTransition::AnySignChange,
                    })
                    .collect();
                self.triggered = Some(EventSet {
                    window_start: self.previous_start_time,
                    window_end: t_ret,
                    events,
                });
                return Ok(StepStatus::ReachedEventTrigger);
            }
            if self.settings.return_every_internal_step {
                return Ok(StepStatus::TimeHasAdvanced);
            }
            // No boundary crossed and per-step notification is off; take
            // another step.
        }
    }

    /// The state the caller should read: the interpolated snapshot while it
    /// is active, otherwise the advanced snapshot.
    pub fn state(&self) -> &State {
        if self.use_interpolated {
            self.interpolated.as_ref().expect("initialized")
        } else {
            self.advanced_state()
        }
    }

    /// The authoritative, continuously advancing snapshot.
    pub fn advanced_state(&self) -> &State {
        self.advanced.as_ref().expect("initialized")
    }

    pub fn time(&self) -> f64 {
        self.state().time()
    }

    /// Events triggered by the most recent root return, if any.
    pub fn triggered_events(&self) -> Option<&EventSet> {
        self.triggered.as_ref()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    pub fn statistics(&self) -> Statistics {
        assert!(self.initialized, "statistics queried before initialize");
        Statistics {
            actual_initial_step: self.engine.actual_initial_step(),
            last_step: self.engine.last_step(),
            predicted_next_step: self.engine.current_step(),
            steps_taken: self.engine.num_steps(),
            error_test_failures: self.engine.num_error_test_failures(),
        }
    }

    pub fn actual_initial_step_taken(&self) -> f64 {
        assert!(self.initialized, "queried before initialize");
        self.engine.actual_initial_step()
    }

    pub fn previous_step_taken(&self) -> f64 {
        assert!(self.initialized, "queried before initialize");
        self.engine.last_step()
    }

    pub fn predicted_next_step(&self) -> f64 {
        assert!(self.initialized, "queried before initialize");
        self.engine.current_step()
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name()
    }

    pub fn method_min_order(&self) -> usize {
        self.method.min_order()
    }

    pub fn method_max_order(&self) -> usize {
        self.method.max_order()
    }

    pub fn has_error_control(&self) -> bool {
        true
    }

    pub fn settings(&self) -> &StepperSettings {
        &self.settings
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn tolerances(&self) -> Tolerances {
        Tolerances {
            relative: self.settings.relative_tolerance,
            absolute: self.settings.absolute_tolerance,
        }
    }

    fn push_settings(&mut self) {
        if let Some(h0) = self.settings.initial_step {
            self.engine.set_initial_step(h0);
        }
        if let Some(hmin) = self.settings.min_step {
            self.engine.set_min_step(hmin);
        }
        if let Some(hmax) = self.settings.max_step {
            self.engine.set_max_step(hmax);
        }
        if let Some(tstop) = self.settings.final_time {
            self.engine.set_stop_time(tstop);
        }
        if let Some(limit) = self.settings.internal_step_limit {
            self.engine.set_max_internal_steps(limit);
        }
        if self.settings.project_every_step {
            self.engine.set_projection_frequency(1);
        }
    }
}

/// Synthesizes an off-grid snapshot at `t`, which must lie strictly inside
/// the last accepted step interval: dense output for the continuous state,
/// discrete content copied from the advanced snapshot.
fn interpolated_at<E: Engine>(engine: &E, advanced: &State, t: f64) -> State {
    let mut interp = advanced.clone();
    let mut yout = DVector::zeros(advanced.y().len());
    engine.interpolate(t, &mut yout);
    interp.set_y(yout);
    interp.set_time(t);
    interp
}
