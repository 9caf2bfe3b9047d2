use flowplan::core::graph;
use flowplan::{FlowError, Job, JobType, Plan};
use proptest::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;

/// Job `i` may depend only on jobs with a lower index, so the graph is a DAG.
fn dag_jobs(n: usize, edges: &[bool]) -> Vec<Job> {
    (0..n)
        .map(|i| {
            let deps: Vec<String> = (0..i)
                .filter(|&j| edges[i * n + j])
                .map(|j| format!("j{}", j))
                .collect();
            Job::new(format!("j{}", i), JobType::Shell).depends_on(deps)
        })
        .collect()
}

fn dag_strategy() -> impl Strategy<Value = (usize, Vec<bool>)> {
    (2usize..16).prop_flat_map(|n| (Just(n), proptest::collection::vec(any::<bool>(), n * n)))
}

proptest! {
    #[test]
    fn random_dags_validate_and_never_reach_themselves((n, edges) in dag_strategy()) {
        let plan = Plan::from_jobs("p", PathBuf::from("."), dag_jobs(n, &edges)).unwrap();

        for job in plan.jobs() {
            let dependents = graph::transitive_dependents(&plan, &job.id);
            prop_assert!(dependents.iter().all(|d| d.id != job.id));
        }
    }

    #[test]
    fn stages_respect_dependencies((n, edges) in dag_strategy()) {
        let plan = Plan::from_jobs("p", PathBuf::from("."), dag_jobs(n, &edges)).unwrap();
        let stages = graph::execution_stages(&plan);

        let mut stage_of = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            for job in stage {
                stage_of.insert(job.id.clone(), i);
            }
        }
        prop_assert_eq!(stage_of.len(), n);
        for job in plan.jobs() {
            for dep in &job.depends_on {
                prop_assert!(stage_of[dep] < stage_of[&job.id]);
            }
        }
    }

    #[test]
    fn injected_back_edge_is_rejected(n in 2usize..16, target in 1usize..16) {
        let target = target.min(n - 1);
        // Chain j0 <- j1 <- ... <- j(n-1), then make j0 depend on a later job.
        let mut jobs: Vec<Job> = (0..n)
            .map(|i| {
                let job = Job::new(format!("j{}", i), JobType::Shell);
                if i == 0 { job } else { job.depends_on([format!("j{}", i - 1)]) }
            })
            .collect();
        jobs[0].depends_on.push(format!("j{}", target));

        let err = Plan::from_jobs("p", PathBuf::from("."), jobs).unwrap_err();
        prop_assert!(matches!(err, FlowError::CircularDependency(_)), "unexpected error");
    }
}
