use proptest::prelude::*;
use std::collections::HashMap;

use forge_engine::config::SafetyConfig;
use forge_engine::conductor::planner::{validate_plan, PlannedStep};
use forge_engine::memory::rank_by_distance;
use forge_engine::safety_policy::{SafetyPolicy, SafetyVerdict};
use sdk::types::Experience;

/// A random DAG: step `i` may depend on any step `j < i`, then the list is
/// shuffled so the input order says nothing about the edges
fn shuffled_dag() -> impl Strategy<Value = Vec<PlannedStep>> {
    (1usize..12)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
                prop::collection::vec(any::<u32>(), n),
            )
        })
        .prop_map(|(edges, shuffle_keys)| {
            let n = edges.len();
            let mut steps: Vec<(u32, PlannedStep)> = (0..n)
                .map(|i| {
                    let dependencies = (0..i)
                        .filter(|&j| edges[i][j])
                        .map(|j| format!("step_{}", j))
                        .collect();
                    (
                        shuffle_keys[i],
                        PlannedStep {
                            key: format!("step_{}", i),
                            description: format!("Do part {}", i),
                            dependencies,
                        },
                    )
                })
                .collect();
            steps.sort_by_key(|(k, _)| *k);
            steps.into_iter().map(|(_, s)| s).collect()
        })
}

proptest! {
    #[test]
    fn test_plan_order_respects_every_edge(steps in shuffled_dag()) {
        let count = steps.len();
        let ordered = validate_plan(steps, 20).unwrap();
        prop_assert_eq!(ordered.len(), count);

        let position: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();
        for (i, step) in ordered.iter().enumerate() {
            for dep in &step.dependencies {
                prop_assert!(position[dep.as_str()] < i);
            }
        }
    }

    #[test]
    fn test_back_edge_always_makes_a_cycle(steps in shuffled_dag()) {
        prop_assume!(steps.len() >= 2);
        let mut steps = steps;
        // Close the chain step_0 -> ... -> step_last -> step_0
        let last = format!("step_{}", steps.len() - 1);
        for step in steps.iter_mut() {
            let index: usize = step.key["step_".len()..].parse().unwrap();
            if index > 0 {
                step.dependencies.push(format!("step_{}", index - 1));
            }
            if index == 0 {
                step.dependencies.push(last.clone());
            }
        }
        prop_assert!(validate_plan(steps, 20).is_err());
    }

    #[test]
    fn test_restricted_call_found_on_any_line(
        before in prop::collection::vec("[a-z]{1,8} = [0-9]{1,4}", 0..6),
        after in prop::collection::vec("print\\([a-z]{1,8}\\)", 0..6),
    ) {
        let policy = SafetyPolicy::from_config(&SafetyConfig::default()).unwrap();
        let mut lines = before.clone();
        lines.push("os.system('ls')".to_string());
        lines.extend(after);
        let artifact = lines.join("\n");

        match policy.check(&artifact) {
            SafetyVerdict::Violation(v) => {
                prop_assert_eq!(v.rule, "os.system");
                prop_assert_eq!(v.line, before.len() + 1);
            }
            SafetyVerdict::Pass => prop_assert!(false, "violation missed"),
        }
        // Same input, same verdict
        prop_assert_eq!(policy.check(&artifact), policy.check(&artifact));
    }

    #[test]
    fn test_ranking_ignores_input_order(
        vectors in prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 4), 0..10),
        query in prop::collection::vec(-1.0f32..1.0, 4),
        k in 0usize..12,
    ) {
        let experiences: Vec<Experience> = vectors
            .into_iter()
            .enumerate()
            .map(|(i, embedding)| Experience {
                id: i as i64 + 1,
                task_id: "task".to_string(),
                step_id: None,
                task_type: "general".to_string(),
                pattern: format!("pattern {}", i),
                outcome: "success".to_string(),
                embedding,
                distance: None,
                created_at: 1_700_000_000 + (i as i64 % 3),
            })
            .collect();
        let count = experiences.len();

        let forward = rank_by_distance(&query, experiences.clone(), k);
        let mut reversed_input = experiences;
        reversed_input.reverse();
        let backward = rank_by_distance(&query, reversed_input, k);

        prop_assert_eq!(forward.len(), k.min(count));
        let ids = |v: &[Experience]| v.iter().map(|e| e.id).collect::<Vec<_>>();
        prop_assert_eq!(ids(&forward), ids(&backward));
        for pair in forward.windows(2) {
            prop_assert!(pair[0].distance.unwrap() <= pair[1].distance.unwrap());
        }
    }
}
