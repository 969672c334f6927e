//! Comparison, ordering, and summary helpers over worker listings.

use std::cmp::Ordering;

use stampgrid_state::WorkerInfo;

/// Identity comparison of two optional workers. Two empty slots are equal.
pub fn same_manager(a: Option<&WorkerInfo>, b: Option<&WorkerInfo>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_worker(b),
        _ => false,
    }
}

/// Removal priority: slave-stamp workers before home-stamp workers, then
/// ascending load factor, then stamp and worker name.
pub fn removing_order(a: &WorkerInfo, b: &WorkerInfo) -> Ordering {
    a.is_home_stamp
        .cmp(&b.is_home_stamp)
        .then(a.load_factor.cmp(&b.load_factor))
        .then_with(|| a.stamp_name.cmp(&b.stamp_name))
        .then_with(|| a.worker_name.cmp(&b.worker_name))
}

/// Workers sorted by [`removing_order`], first to remove first.
pub fn sort_by_removing_order(workers: &[WorkerInfo]) -> Vec<WorkerInfo> {
    let mut sorted = workers.to_vec();
    sorted.sort_by(removing_order);
    sorted
}

/// Distinct stamp names, in first-seen order.
pub fn candidate_stamps(workers: &[WorkerInfo]) -> Vec<String> {
    let mut stamps: Vec<String> = Vec::new();
    for worker in workers {
        if !stamps.contains(&worker.stamp_name) {
            stamps.push(worker.stamp_name.clone());
        }
    }
    stamps
}

/// `"<prefix> N workers: stamp:worker(load), ..."`
pub fn worker_summary(prefix: &str, workers: &[WorkerInfo]) -> String {
    let entries: Vec<String> = workers
        .iter()
        .map(|w| format!("{}:{}({})", w.stamp_name, w.worker_name, display_load(w.load_factor)))
        .collect();
    if entries.is_empty() {
        format!("{prefix} 0 workers")
    } else {
        format!("{prefix} {} workers: {}", workers.len(), entries.join(", "))
    }
}

fn display_load(load_factor: i32) -> String {
    match load_factor {
        i32::MAX => "max".to_string(),
        i32::MIN => "min".to_string(),
        n => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampgrid_state::{LOAD_FACTOR_MAX, LOAD_FACTOR_MIN};

    fn worker(stamp: &str, name: &str, load: i32) -> WorkerInfo {
        WorkerInfo::new("site", stamp, name, "home").with_load_factor(load)
    }

    #[test]
    fn slave_workers_are_removed_before_home_workers() {
        let workers = vec![
            worker("home", "h-free", 10),
            worker("home", "h-busy", 90),
            worker("slave", "s-busy", 90),
            worker("slave", "s-free", 10),
        ];

        let names: Vec<String> = sort_by_removing_order(&workers)
            .into_iter()
            .map(|w| w.worker_name)
            .collect();

        assert_eq!(names, ["s-free", "s-busy", "h-free", "h-busy"]);
    }

    #[test]
    fn swap_sentinel_sorts_first_within_a_stamp() {
        let workers = vec![
            worker("slave", "s1", 5),
            worker("slave", "s2", LOAD_FACTOR_MIN),
            worker("slave", "s3", LOAD_FACTOR_MAX),
        ];
        let sorted = sort_by_removing_order(&workers);
        assert_eq!(sorted[0].worker_name, "s2");
        assert_eq!(sorted[2].worker_name, "s3");
    }

    #[test]
    fn ties_break_on_stamp_then_worker_name() {
        let workers = vec![
            worker("slave-b", "w1", 10),
            worker("slave-a", "w2", 10),
            worker("slave-a", "w1", 10),
        ];
        let sorted = sort_by_removing_order(&workers);
        assert_eq!(sorted[0].display_name(), "site/slave-a:w1");
        assert_eq!(sorted[1].display_name(), "site/slave-a:w2");
        assert_eq!(sorted[2].display_name(), "site/slave-b:w1");
    }

    #[test]
    fn candidate_stamps_are_distinct_in_order() {
        let workers = vec![
            worker("slave", "w1", 10),
            worker("home", "w2", 10),
            worker("slave", "w3", 10),
        ];
        assert_eq!(candidate_stamps(&workers), ["slave", "home"]);
        assert!(candidate_stamps(&[]).is_empty());
    }

    #[test]
    fn same_manager_compares_identity() {
        let a = worker("home", "w1", 10);
        let b = worker("home", "w1", 99);
        let c = worker("home", "w2", 10);

        assert!(same_manager(None, None));
        assert!(same_manager(Some(&a), Some(&b)));
        assert!(!same_manager(Some(&a), Some(&c)));
        assert!(!same_manager(Some(&a), None));
    }

    #[test]
    fn summary_lists_workers() {
        let workers = vec![worker("home", "w1", 10), worker("slave", "w2", LOAD_FACTOR_MAX)];
        assert_eq!(
            worker_summary("NonStale", &workers),
            "NonStale 2 workers: home:w1(10), slave:w2(max)"
        );
        assert_eq!(worker_summary("Stale", &[]), "Stale 0 workers");
    }
}
