use proptest::prelude::*;
use sdk::errors::{EngineError, ErrorExt, ErrorScope};
use sdk::types::{ErrorKind, StepStatus, TaskStatus};

fn step_status() -> impl Strategy<Value = StepStatus> {
    prop_oneof![
        Just(StepStatus::Succeeded),
        Just(StepStatus::FixExhausted),
        Just(StepStatus::SafetyViolation),
        Just(StepStatus::Skipped),
    ]
}

proptest! {
    #[test]
    fn test_roll_up_completed_iff_every_step_succeeded(
        steps in prop::collection::vec(step_status(), 1..20)
    ) {
        let status = TaskStatus::roll_up(&steps);
        let all_ok = steps.iter().all(|s| *s == StepStatus::Succeeded);
        prop_assert_eq!(status == TaskStatus::Completed, all_ok);
        prop_assert!(status.is_terminal());
    }

    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Generation(error_str.clone()),
            EngineError::SafetyViolation(error_str.clone()),
            EngineError::ExecutionException(error_str.clone()),
            EngineError::MemoryWrite(error_str.clone()),
            EngineError::MemoryRead(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            // hints are static text, never the raw error payload
            if error_str.len() > 12 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }

    #[test]
    fn test_terminal_task_states_have_no_exit(idx in 0usize..7, next in 0usize..7) {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::PlanFailed,
            TaskStatus::Executing,
            TaskStatus::Completed,
            TaskStatus::PartiallyCompleted,
            TaskStatus::Aborted,
        ];
        if all[idx].is_terminal() {
            prop_assert!(!all[idx].can_transition_to(all[next]));
        }
    }
}

#[test]
fn test_every_error_kind_parses_from_its_label() {
    for kind in ErrorKind::ALL {
        assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
    }
    assert!("segfault".parse::<ErrorKind>().is_err());
}

#[test]
fn test_step_fatal_errors() {
    assert_eq!(EngineError::FixExhausted { attempts: 3 }.scope(), ErrorScope::Step);
    assert_eq!(
        EngineError::SafetyViolation("eval".to_string()).scope(),
        ErrorScope::Step
    );
}
