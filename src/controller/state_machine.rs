//! Finite state machine for the MongoDB lifecycle
//!
//! Phases move along an explicit transition table. Each transition may carry
//! a guard evaluated against a [`TransitionContext`]; the reconciler only
//! writes a new phase after the table accepted the move.

use std::fmt;

use crate::crd::{LifecyclePhase, TerminationPolicy};

/// Events that drive the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The operator saw the resource for the first time
    Observed,
    /// A new resource claimed the dormant record of its paused predecessor
    Resumed,
    /// Child resources exist and an initialization source still has to run
    InitRequired,
    /// Child resources exist and nothing is left to initialize
    Materialized,
    InitSucceeded,
    InitFailed,
    InitTimedOut,
    /// The generation advanced past the one that failed
    SpecChanged,
    /// A deletion timestamp appeared on the resource
    DeletionRequested,
    /// Workloads are gone and the dormant record holds the origin
    WorkloadsPaused,
    /// Workloads are gone, volumes and secrets are kept
    WorkloadsHalted,
    /// Workloads, volumes and exclusively owned secrets are gone
    DataWipedOut,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::Observed => "Observed",
            LifecycleEvent::Resumed => "Resumed",
            LifecycleEvent::InitRequired => "InitRequired",
            LifecycleEvent::Materialized => "Materialized",
            LifecycleEvent::InitSucceeded => "InitSucceeded",
            LifecycleEvent::InitFailed => "InitFailed",
            LifecycleEvent::InitTimedOut => "InitTimedOut",
            LifecycleEvent::SpecChanged => "SpecChanged",
            LifecycleEvent::DeletionRequested => "DeletionRequested",
            LifecycleEvent::WorkloadsPaused => "WorkloadsPaused",
            LifecycleEvent::WorkloadsHalted => "WorkloadsHalted",
            LifecycleEvent::DataWipedOut => "DataWipedOut",
        };
        f.write_str(name)
    }
}

/// Facts the guards look at
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub termination_policy: TerminationPolicy,
    /// An init source is declared and was never attempted
    pub init_pending: bool,
    /// `metadata.generation` is ahead of `status.observedGeneration`
    pub spec_changed: bool,
}

impl TransitionContext {
    pub fn new(termination_policy: TerminationPolicy) -> Self {
        Self {
            termination_policy,
            init_pending: false,
            spec_changed: false,
        }
    }

    pub fn with_init_pending(mut self, init_pending: bool) -> Self {
        self.init_pending = init_pending;
        self
    }

    pub fn with_spec_changed(mut self, spec_changed: bool) -> Self {
        self.spec_changed = spec_changed;
        self
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
    pub event: LifecycleEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: LifecyclePhase,
        to: LifecyclePhase,
        event: LifecycleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: LifecyclePhase,
        to: LifecyclePhase,
        event: LifecycleEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: LifecyclePhase,
        event: LifecycleEvent,
    },
    GuardFailed {
        from: LifecyclePhase,
        to: LifecyclePhase,
        event: LifecycleEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase when the transition was accepted
    pub fn target(&self) -> Option<LifecyclePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Lifecycle transition table for MongoDB resources
pub struct LifecycleStateMachine {
    transitions: Vec<Transition>,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    pub fn new() -> Self {
        use LifecycleEvent as E;
        use LifecyclePhase as P;

        let mut transitions = vec![
            Transition::new(P::Pending, P::Creating, E::Observed, "First observation"),
            Transition::new(
                P::Pending,
                P::Creating,
                E::Resumed,
                "Resuming from the dormant record",
            ),
            Transition::new(
                P::Creating,
                P::Initializing,
                E::InitRequired,
                "Applying initialization source",
            ),
            Transition::new(
                P::Creating,
                P::Running,
                E::Materialized,
                "All child resources materialized",
            ),
            Transition::new(
                P::Initializing,
                P::Running,
                E::InitSucceeded,
                "Initialization completed",
            ),
            Transition::new(
                P::Initializing,
                P::Failed,
                E::InitFailed,
                "Initialization job failed",
            ),
            Transition::new(
                P::Initializing,
                P::Failed,
                E::InitTimedOut,
                "Initialization did not finish in time",
            ),
            Transition::new(
                P::Failed,
                P::Creating,
                E::SpecChanged,
                "Spec changed after a failure, retrying",
            ),
            Transition::new(
                P::Pausing,
                P::Paused,
                E::WorkloadsPaused,
                "Workloads removed, origin retained",
            ),
            Transition::new(
                P::Pausing,
                P::Halted,
                E::WorkloadsHalted,
                "Workloads removed, data retained",
            ),
            Transition::new(
                P::Pausing,
                P::WipedOut,
                E::DataWipedOut,
                "Workloads and data removed",
            ),
        ];

        // Deletion may arrive in any live phase
        for from in [
            P::Pending,
            P::Creating,
            P::Initializing,
            P::Running,
            P::Failed,
        ] {
            transitions.push(Transition::new(
                from,
                P::Pausing,
                E::DeletionRequested,
                "Deletion requested, tearing down workloads",
            ));
        }

        Self { transitions }
    }

    pub fn transition(
        &self,
        current: LifecyclePhase,
        event: LifecycleEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition exists, ignoring guards
    pub fn can_transition(&self, from: LifecyclePhase, event: LifecycleEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: LifecyclePhase) -> Vec<LifecycleEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        let policy = ctx.termination_policy;
        match transition.event {
            LifecycleEvent::InitRequired if !ctx.init_pending => {
                Some("no pending initialization source".to_string())
            }
            LifecycleEvent::Materialized if ctx.init_pending => {
                Some("initialization source not applied yet".to_string())
            }
            LifecycleEvent::SpecChanged if !ctx.spec_changed => {
                Some("generation did not advance since the failure".to_string())
            }
            LifecycleEvent::DeletionRequested if policy == TerminationPolicy::DoNotTerminate => {
                Some("termination policy DoNotTerminate forbids deletion".to_string())
            }
            LifecycleEvent::WorkloadsPaused if policy != TerminationPolicy::Pause => {
                Some(format!("termination policy is {}", policy))
            }
            LifecycleEvent::WorkloadsHalted if policy != TerminationPolicy::Halt => {
                Some(format!("termination policy is {}", policy))
            }
            LifecycleEvent::DataWipedOut if policy != TerminationPolicy::WipeOut => {
                Some(format!("termination policy is {}", policy))
            }
            _ => None,
        }
    }
}

/// Next event for the reconciler to apply, if any
pub fn determine_event(
    current: LifecyclePhase,
    ctx: &TransitionContext,
    has_deletion_timestamp: bool,
    resuming: bool,
) -> Option<LifecycleEvent> {
    if has_deletion_timestamp {
        return match current {
            LifecyclePhase::Pausing => Some(teardown_event(ctx.termination_policy)),
            _ => Some(LifecycleEvent::DeletionRequested),
        };
    }

    match current {
        LifecyclePhase::Pending if resuming => Some(LifecycleEvent::Resumed),
        LifecyclePhase::Pending => Some(LifecycleEvent::Observed),
        LifecyclePhase::Creating if ctx.init_pending => Some(LifecycleEvent::InitRequired),
        LifecyclePhase::Creating => Some(LifecycleEvent::Materialized),
        LifecyclePhase::Failed if ctx.spec_changed => Some(LifecycleEvent::SpecChanged),
        _ => None,
    }
}

/// Completion event of a teardown under the given policy
pub fn teardown_event(policy: TerminationPolicy) -> LifecycleEvent {
    match policy {
        TerminationPolicy::Halt => LifecycleEvent::WorkloadsHalted,
        TerminationPolicy::WipeOut => LifecycleEvent::DataWipedOut,
        TerminationPolicy::Pause | TerminationPolicy::DoNotTerminate => {
            LifecycleEvent::WorkloadsPaused
        }
    }
}
