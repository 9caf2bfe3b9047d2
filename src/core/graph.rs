//! Dependency graph - resolution, validation and frontier computation

use std::collections::{HashMap, HashSet, VecDeque};

use super::job::{Job, JobStatus};
use super::plan::Plan;
use crate::error::{FlowError, Result};

/// Fail on the first job ID that was already used by an earlier file.
pub(crate) fn check_duplicates(jobs: &[Job]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for job in jobs {
        if let Some(first) = seen.insert(&job.id, &job.filename) {
            return Err(FlowError::DuplicateJobId {
                id: job.id.clone(),
                first: first.to_string(),
                second: job.filename.clone(),
            });
        }
    }
    Ok(())
}

/// Turn each declared `depends_on` string into an index, matching by ID
/// first and by filename second.
pub(crate) fn resolve_dependencies(jobs: &mut [Job]) -> Result<()> {
    let by_id: HashMap<String, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.id.clone(), i))
        .collect();
    let by_file: HashMap<String, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.filename.clone(), i))
        .collect();

    for job in jobs.iter_mut() {
        let mut resolved = Vec::with_capacity(job.depends_on.len());
        for dep in &job.depends_on {
            let idx = by_id
                .get(dep)
                .or_else(|| by_file.get(dep))
                .copied()
                .ok_or_else(|| FlowError::NonExistentJob {
                    job: job.id.clone(),
                    missing: dep.clone(),
                })?;
            if !resolved.contains(&idx) {
                resolved.push(idx);
            }
        }
        job.dependencies = resolved;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Three-colour DFS over resolved dependencies. The error carries the cycle
/// path, starting and ending at the same job.
pub(crate) fn detect_cycles(jobs: &[Job]) -> Result<()> {
    let mut marks = vec![Mark::Unvisited; jobs.len()];
    let mut path = Vec::new();

    for start in 0..jobs.len() {
        if marks[start] == Mark::Unvisited {
            visit(jobs, start, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit(jobs: &[Job], node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Result<()> {
    marks[node] = Mark::InProgress;
    path.push(node);

    for &dep in &jobs[node].dependencies {
        match marks[dep] {
            Mark::InProgress => {
                let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[from..].iter().map(|&n| jobs[n].id.clone()).collect();
                cycle.push(jobs[dep].id.clone());
                return Err(FlowError::CircularDependency(cycle));
            }
            Mark::Unvisited => visit(jobs, dep, marks, path)?,
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node] = Mark::Done;
    Ok(())
}

/// Every runnable job, in declaration order.
pub fn runnable_jobs(plan: &Plan) -> Vec<&Job> {
    plan.jobs().iter().filter(|j| j.is_runnable(plan)).collect()
}

/// Group unfinished jobs into waves. Every job in a wave depends only on
/// completed jobs or on jobs in earlier waves.
pub fn execution_stages(plan: &Plan) -> Vec<Vec<&Job>> {
    let jobs = plan.jobs();
    let open: Vec<usize> = (0..jobs.len())
        .filter(|&i| jobs[i].status() != JobStatus::Completed)
        .collect();
    let open_set: HashSet<usize> = open.iter().copied().collect();

    let mut indegree: HashMap<usize, usize> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in &open {
        let pending_deps: Vec<usize> = jobs[i]
            .dependencies
            .iter()
            .copied()
            .filter(|d| open_set.contains(d))
            .collect();
        indegree.insert(i, pending_deps.len());
        for d in pending_deps {
            dependents.entry(d).or_default().push(i);
        }
    }

    let mut stages = Vec::new();
    let mut current: Vec<usize> = open.iter().copied().filter(|i| indegree[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &d in dependents.get(&i).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(n) = indegree.get_mut(&d) {
                    *n -= 1;
                    if *n == 0 {
                        next.push(d);
                    }
                }
            }
        }
        next.sort_unstable();
        stages.push(current.iter().map(|&i| &jobs[i]).collect());
        current = next;
    }
    stages
}

/// Every job that directly or indirectly depends on `id`, in declaration
/// order.
pub fn transitive_dependents<'a>(plan: &'a Plan, id: &str) -> Vec<&'a Job> {
    let jobs = plan.jobs();
    let Some(root) = plan.index_of(id) else {
        return Vec::new();
    };

    let mut reached = vec![false; jobs.len()];
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        for (i, job) in jobs.iter().enumerate() {
            if !reached[i] && job.dependencies.contains(&node) {
                reached[i] = true;
                queue.push_back(i);
            }
        }
    }

    jobs.iter()
        .enumerate()
        .filter(|(i, _)| reached[*i])
        .map(|(_, j)| j)
        .collect()
}

/// Render the plan as a mermaid flowchart with one class per status.
pub fn to_mermaid(plan: &Plan) -> String {
    let mut out = String::from("graph TD\n");
    for job in plan.jobs() {
        out.push_str(&format!(
            "    {}[\"{}\"]:::{}\n",
            node_id(&job.id),
            job.title.replace('"', "'"),
            job.status().as_str()
        ));
    }
    for job in plan.jobs() {
        for dep in plan.dependencies_of(job) {
            out.push_str(&format!("    {} --> {}\n", node_id(&dep.id), node_id(&job.id)));
        }
    }
    out.push_str("    classDef pending fill:#eee,stroke:#999\n");
    out.push_str("    classDef running fill:#fff3b0,stroke:#c9a400\n");
    out.push_str("    classDef completed fill:#c8f7c5,stroke:#2e8b57\n");
    out.push_str("    classDef failed fill:#f7c5c5,stroke:#b22222\n");
    out.push_str("    classDef pending_user fill:#c5d8f7,stroke:#1e4fa0\n");
    out
}

fn node_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobType;
    use std::path::PathBuf;

    fn job(id: &str, deps: &[&str]) -> Job {
        Job::new(id, JobType::Shell).depends_on(deps.iter().copied())
    }

    fn plan(jobs: Vec<Job>) -> Plan {
        Plan::from_jobs("test", PathBuf::from("."), jobs).unwrap()
    }

    fn ids(jobs: &[&Job]) -> Vec<String> {
        jobs.iter().map(|j| j.id.clone()).collect()
    }

    #[test]
    fn test_runnable_frontier() {
        let p = plan(vec![
            job("a", &[]).with_status(JobStatus::Completed),
            job("b", &["a"]),
            job("c", &["b"]),
        ]);
        assert_eq!(ids(&runnable_jobs(&p)), vec!["b"]);
    }

    #[test]
    fn test_is_runnable_truth_table() {
        let p = plan(vec![
            job("a", &[]).with_status(JobStatus::Completed),
            job("b", &["a"]),
            job("c", &["b"]),
            job("d", &["a"]).with_status(JobStatus::Failed),
            job("e", &[]).with_status(JobStatus::Running),
        ]);
        let runnable = |id: &str| p.get(id).unwrap().is_runnable(&p);
        assert!(runnable("b"));
        assert!(!runnable("c"));
        assert!(!runnable("a"));
        assert!(!runnable("d"));
        assert!(!runnable("e"));
    }

    #[test]
    fn test_resolves_by_filename() {
        let mut a = job("setup", &[]);
        a.filename = "01-setup.md".into();
        let p = plan(vec![a, job("build", &["01-setup.md"])]);
        let deps: Vec<_> = p.dependencies_of(p.get("build").unwrap()).collect();
        assert_eq!(deps[0].id, "setup");
    }

    #[test]
    fn test_missing_dependency() {
        let err = Plan::from_jobs("t", PathBuf::from("."), vec![job("a", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("non-existent job"));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_id_checked_first() {
        let err = Plan::from_jobs(
            "t",
            PathBuf::from("."),
            vec![job("a", &["ghost"]), job("a", &[])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate job ID"));
    }

    #[test]
    fn test_cycle_path_reported() {
        let err = Plan::from_jobs(
            "t",
            PathBuf::from("."),
            vec![job("a", &["c"]), job("b", &["a"]), job("c", &["b"])],
        )
        .unwrap_err();
        match err {
            FlowError::CircularDependency(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = Plan::from_jobs("t", PathBuf::from("."), vec![job("a", &["a"])]).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn test_execution_stages_diamond() {
        let p = plan(vec![
            job("01", &[]),
            job("02", &["01"]),
            job("03", &["01"]),
            job("04", &["02", "03"]),
        ]);
        let stages: Vec<Vec<String>> = execution_stages(&p).iter().map(|s| ids(s)).collect();
        assert_eq!(stages, vec![vec!["01"], vec!["02", "03"], vec!["04"]]);
    }

    #[test]
    fn test_execution_stages_skip_completed() {
        let p = plan(vec![
            job("01", &[]).with_status(JobStatus::Completed),
            job("02", &["01"]),
        ]);
        let stages: Vec<Vec<String>> = execution_stages(&p).iter().map(|s| ids(s)).collect();
        assert_eq!(stages, vec![vec!["02"]]);
    }

    #[test]
    fn test_transitive_dependents() {
        let p = plan(vec![
            job("01", &[]),
            job("02", &["01"]),
            job("03", &[]),
            job("04", &["02"]),
        ]);
        assert_eq!(ids(&transitive_dependents(&p, "01")), vec!["02", "04"]);
        assert!(transitive_dependents(&p, "03").is_empty());
    }

    #[test]
    fn test_mermaid_edges() {
        let p = plan(vec![job("01-a", &[]), job("02-b", &["01-a"])]);
        let out = to_mermaid(&p);
        assert!(out.starts_with("graph TD\n"));
        assert!(out.contains("01_a --> 02_b"));
        assert!(out.contains(":::pending"));
    }
}
