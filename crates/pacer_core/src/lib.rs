pub mod bridge;
pub mod engine;
pub mod events;
/// The `pacer_core` crate couples a stateful physical simulation to an
/// external multistep ODE engine and presents a report-time/event-time
/// oriented stepping interface on top of it.
///
/// Key components:
/// - **System**: the simulated-system surface (staged snapshots, derived
///   vectors, manifold projection, event identification).
/// - **Engine**: the black-box solver protocol (init/step/dense output/root
///   info) plus the reciprocal callbacks it invokes.
/// - **SystemBridge**: translates the engine's flat-vector callbacks into
///   staged snapshot realizations, absorbing recoverable failures.
/// - **Integrator**: the stepping state machine deciding, per call, whether
///   a report time, scheduled event, event trigger, stop time, or step
///   limit was reached.
pub mod integrator;
pub mod system;

pub use engine::{
    CallbackStatus, Engine, EngineCallbacks, InitRejected, IterationType, Method, StepMode,
    StepResult, Tolerances,
};
pub use events::{EventSet, EventTransition, TriggeredEvent};
pub use integrator::{
    Integrator, IntegratorError, Statistics, StepStatus, StepperSettings, TerminationReason,
};
pub use system::{Stage, State, System};
