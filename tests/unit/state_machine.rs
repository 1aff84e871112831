//! Additional unit tests for lifecycle transitions

use mongodb_operator::controller::state_machine::{
    LifecycleEvent, LifecycleStateMachine, TransitionContext, TransitionResult, determine_event,
    teardown_event,
};
use mongodb_operator::crd::{LifecyclePhase, TerminationPolicy};

const POLICIES: [TerminationPolicy; 4] = [
    TerminationPolicy::DoNotTerminate,
    TerminationPolicy::Pause,
    TerminationPolicy::Halt,
    TerminationPolicy::WipeOut,
];

const EVENTS: [LifecycleEvent; 12] = [
    LifecycleEvent::Observed,
    LifecycleEvent::Resumed,
    LifecycleEvent::InitRequired,
    LifecycleEvent::Materialized,
    LifecycleEvent::InitSucceeded,
    LifecycleEvent::InitFailed,
    LifecycleEvent::InitTimedOut,
    LifecycleEvent::SpecChanged,
    LifecycleEvent::DeletionRequested,
    LifecycleEvent::WorkloadsPaused,
    LifecycleEvent::WorkloadsHalted,
    LifecycleEvent::DataWipedOut,
];

mod transition_context_tests {
    use super::*;

    #[test]
    fn test_new_context() {
        let ctx = TransitionContext::new(TerminationPolicy::Halt);
        assert_eq!(ctx.termination_policy, TerminationPolicy::Halt);
        assert!(!ctx.init_pending);
        assert!(!ctx.spec_changed);
    }

    #[test]
    fn test_builder_flags() {
        let ctx = TransitionContext::new(TerminationPolicy::Pause)
            .with_init_pending(true)
            .with_spec_changed(true);
        assert!(ctx.init_pending);
        assert!(ctx.spec_changed);
    }
}

mod creation_path_tests {
    use super::*;

    #[test]
    fn test_plain_path_reaches_running() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause);

        let mut phase = LifecyclePhase::Pending;
        for _ in 0..2 {
            let event = determine_event(phase, &ctx, false, false).unwrap();
            phase = sm.transition(phase, event, &ctx).target().unwrap();
        }
        assert_eq!(phase, LifecyclePhase::Running);
        assert_eq!(determine_event(phase, &ctx, false, false), None);
    }

    #[test]
    fn test_init_path_goes_through_initializing() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause).with_init_pending(true);

        let result = sm.transition(LifecyclePhase::Pending, LifecycleEvent::Observed, &ctx);
        assert_eq!(result.target(), Some(LifecyclePhase::Creating));

        let event = determine_event(LifecyclePhase::Creating, &ctx, false, false);
        assert_eq!(event, Some(LifecycleEvent::InitRequired));

        let result = sm.transition(LifecyclePhase::Creating, LifecycleEvent::InitRequired, &ctx);
        assert_eq!(result.target(), Some(LifecyclePhase::Initializing));

        let result = sm.transition(LifecyclePhase::Initializing, LifecycleEvent::InitSucceeded, &ctx);
        assert_eq!(result.target(), Some(LifecyclePhase::Running));
    }

    #[test]
    fn test_init_required_guarded_without_source() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause);
        let result = sm.transition(LifecyclePhase::Creating, LifecycleEvent::InitRequired, &ctx);
        match result {
            TransitionResult::GuardFailed { from, to, reason, .. } => {
                assert_eq!(from, LifecyclePhase::Creating);
                assert_eq!(to, LifecyclePhase::Initializing);
                assert!(!reason.is_empty());
            }
            other => panic!("expected guard failure, got {:?}", other),
        }
    }

    #[test]
    fn test_resume_enters_creating() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause);
        assert_eq!(
            determine_event(LifecyclePhase::Pending, &ctx, false, true),
            Some(LifecycleEvent::Resumed)
        );
        let result = sm.transition(LifecyclePhase::Pending, LifecycleEvent::Resumed, &ctx);
        assert_eq!(result.target(), Some(LifecyclePhase::Creating));
    }

    #[test]
    fn test_resume_not_valid_after_creation() {
        let sm = LifecycleStateMachine::new();
        for phase in [
            LifecyclePhase::Creating,
            LifecyclePhase::Initializing,
            LifecyclePhase::Running,
            LifecyclePhase::Failed,
        ] {
            assert!(!sm.can_transition(phase, LifecycleEvent::Resumed));
        }
    }
}

mod failure_tests {
    use super::*;

    #[test]
    fn test_both_init_failures_land_in_failed() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause);
        for event in [LifecycleEvent::InitFailed, LifecycleEvent::InitTimedOut] {
            let result = sm.transition(LifecyclePhase::Initializing, event, &ctx);
            assert_eq!(result.target(), Some(LifecyclePhase::Failed));
        }
    }

    #[test]
    fn test_failed_never_moves_to_initializing() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Pause)
            .with_init_pending(true)
            .with_spec_changed(true);
        for event in EVENTS {
            let result = sm.transition(LifecyclePhase::Failed, event, &ctx);
            assert_ne!(result.target(), Some(LifecyclePhase::Initializing));
        }
    }

    #[test]
    fn test_failed_waits_for_generation() {
        let unchanged = TransitionContext::new(TerminationPolicy::Pause);
        assert_eq!(
            determine_event(LifecyclePhase::Failed, &unchanged, false, false),
            None
        );
        let changed = unchanged.with_spec_changed(true);
        assert_eq!(
            determine_event(LifecyclePhase::Failed, &changed, false, false),
            Some(LifecycleEvent::SpecChanged)
        );
    }

    #[test]
    fn test_failed_can_be_deleted() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::WipeOut);
        let result = sm.transition(LifecyclePhase::Failed, LifecycleEvent::DeletionRequested, &ctx);
        assert_eq!(result.target(), Some(LifecyclePhase::Pausing));
    }
}

mod teardown_tests {
    use super::*;

    #[test]
    fn test_deletion_from_every_live_phase() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::Halt);
        for phase in [
            LifecyclePhase::Pending,
            LifecyclePhase::Creating,
            LifecyclePhase::Initializing,
            LifecyclePhase::Running,
            LifecyclePhase::Failed,
        ] {
            let result = sm.transition(phase, LifecycleEvent::DeletionRequested, &ctx);
            assert_eq!(result.target(), Some(LifecyclePhase::Pausing), "from {}", phase);
        }
    }

    #[test]
    fn test_do_not_terminate_blocks_every_phase() {
        let sm = LifecycleStateMachine::new();
        let ctx = TransitionContext::new(TerminationPolicy::DoNotTerminate);
        for phase in LifecyclePhase::ALL {
            let result = sm.transition(phase, LifecycleEvent::DeletionRequested, &ctx);
            assert_eq!(result.target(), None, "from {}", phase);
        }
    }

    #[test]
    fn test_each_policy_has_one_outcome() {
        let sm = LifecycleStateMachine::new();
        let expected = [
            (TerminationPolicy::Pause, LifecyclePhase::Paused),
            (TerminationPolicy::Halt, LifecyclePhase::Halted),
            (TerminationPolicy::WipeOut, LifecyclePhase::WipedOut),
        ];
        for (policy, outcome) in expected {
            let ctx = TransitionContext::new(policy);
            let accepted: Vec<_> = EVENTS
                .iter()
                .filter_map(|e| sm.transition(LifecyclePhase::Pausing, *e, &ctx).target())
                .collect();
            assert_eq!(accepted, vec![outcome], "policy {}", policy);
            assert_eq!(
                sm.transition(LifecyclePhase::Pausing, teardown_event(policy), &ctx)
                    .target(),
                Some(outcome)
            );
        }
    }

    #[test]
    fn test_pausing_continues_teardown() {
        let ctx = TransitionContext::new(TerminationPolicy::WipeOut);
        assert_eq!(
            determine_event(LifecyclePhase::Pausing, &ctx, true, false),
            Some(LifecycleEvent::DataWipedOut)
        );
        assert_eq!(determine_event(LifecyclePhase::Pausing, &ctx, false, false), None);
    }

    #[test]
    fn test_outcome_phases_accept_nothing() {
        let sm = LifecycleStateMachine::new();
        for phase in [
            LifecyclePhase::Paused,
            LifecyclePhase::Halted,
            LifecyclePhase::WipedOut,
        ] {
            assert!(sm.valid_events(phase).is_empty(), "{} accepts events", phase);
            for policy in POLICIES {
                let ctx = TransitionContext::new(policy);
                for event in EVENTS {
                    assert!(matches!(
                        sm.transition(phase, event, &ctx),
                        TransitionResult::InvalidTransition { .. }
                    ));
                }
            }
        }
    }

    #[test]
    fn test_running_only_leaves_through_deletion() {
        let sm = LifecycleStateMachine::new();
        assert_eq!(
            sm.valid_events(LifecyclePhase::Running),
            vec![LifecycleEvent::DeletionRequested]
        );
    }
}

mod display_tests {
    use super::*;

    #[test]
    fn test_event_display_names() {
        assert_eq!(LifecycleEvent::Observed.to_string(), "Observed");
        assert_eq!(LifecycleEvent::InitTimedOut.to_string(), "InitTimedOut");
        assert_eq!(LifecycleEvent::DataWipedOut.to_string(), "DataWipedOut");
    }

    #[test]
    fn test_phase_display_names() {
        assert_eq!(LifecyclePhase::WipedOut.to_string(), "WipedOut");
        assert_eq!(LifecyclePhase::Initializing.to_string(), "Initializing");
    }
}
