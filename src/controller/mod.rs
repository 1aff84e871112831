pub mod context;
pub mod dormant;
pub mod engine;
pub mod error;
pub mod events;
pub mod initializer;
pub mod lifecycle;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use context::Context;
pub use dormant::reconcile_dormant;
pub use engine::{error_policy, reconcile_dormant_record, reconcile_mongodb, run};
pub use error::{BackoffConfig, Error, Result};
pub use events::{Event, EventSink, KubeEventSink, MemoryEventSink};
pub use reconciler::{FINALIZER, reconcile};
pub use state_machine::{LifecycleEvent, LifecycleStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager, spec_changed};
pub use validation::{validate_spec, validate_spec_change};
pub use kube::runtime::controller::Action;
