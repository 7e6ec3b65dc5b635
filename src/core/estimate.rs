//! Runtime estimation from historical command durations
//!
//! A subtree's span is its own command's duration followed by the makespan
//! of its children, simulated with arrival-order list scheduling over
//! `lanes` identical slots. Commands without history contribute nothing.

use super::tree::{NodeId, TaskTree};
use std::fmt;
use std::time::{Duration, Instant};

/// Remaining time for a running node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Remaining(Duration),
    Unknown,
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remaining(d) => write!(f, "{}", format_duration(*d)),
            Self::Unknown => write!(f, "Unknown!"),
        }
    }
}

/// Makespan of `durations` placed in order on `lanes` lanes.
///
/// Every job goes on a free lane at the current time; once all lanes are
/// busy, time advances to the earliest finishing lane which takes the next
/// job. This is not shortest-job-first, so the result depends on order.
pub fn list_schedule<I>(durations: I, lanes: usize) -> Duration
where
    I: IntoIterator<Item = Duration>,
{
    let lanes = lanes.max(1);
    let mut finish_times: Vec<Duration> = Vec::with_capacity(lanes);
    let mut now = Duration::ZERO;
    let mut span = Duration::ZERO;

    for duration in durations {
        if finish_times.len() == lanes {
            // earliest finisher frees its lane
            let (idx, earliest) = finish_times
                .iter()
                .copied()
                .enumerate()
                .min_by_key(|(_, t)| *t)
                .unwrap_or((0, now));
            finish_times.swap_remove(idx);
            now = earliest;
        }
        let end = now + duration;
        finish_times.push(end);
        span = span.max(end);
    }
    span
}

/// Estimator over a task tree with a fixed lane count
#[derive(Debug, Clone, Copy)]
pub struct RuntimeEstimator {
    lanes: usize,
}

impl RuntimeEstimator {
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes: lanes.max(1),
        }
    }

    /// Expected wall-clock span of a subtree
    pub fn subtree(&self, tree: &TaskTree, id: NodeId) -> Duration {
        let node = tree.node(id);
        let own = node.estimate.unwrap_or(Duration::ZERO);
        let children = node
            .children
            .iter()
            .filter_map(|child| self.known_subtree(tree, *child));
        own + list_schedule(children, self.lanes)
    }

    /// Subtree span, or `None` when nothing below has history
    fn known_subtree(&self, tree: &TaskTree, id: NodeId) -> Option<Duration> {
        let known = tree
            .walk(id)
            .into_iter()
            .any(|n| tree.node(n).estimate.is_some());
        known.then(|| self.subtree(tree, id))
    }

    /// Expected span of the whole run: steps execute one after another
    pub fn total(&self, tree: &TaskTree) -> Duration {
        tree.roots().iter().map(|root| self.subtree(tree, *root)).sum()
    }

    /// Countdown for a running node: history minus elapsed time
    pub fn current_eta(&self, tree: &TaskTree, id: NodeId, now: Instant) -> Eta {
        let node = tree.node(id);
        match node.estimate {
            Some(estimate) if !estimate.is_zero() => {
                Eta::Remaining(estimate.saturating_sub(node.elapsed(now)))
            }
            _ => Eta::Unknown,
        }
    }
}

/// Format a Duration the way the status lines show it
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < 60 {
        format!("{}s", total_secs)
    } else if total_secs < 3600 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{}m{}s", mins, secs)
    } else {
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        format!("{}h{}m", hours, mins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tree::TaskSpec;
    use crate::history::{DurationCache, DurationStore};

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[test]
    fn test_list_schedule_is_not_averaged() {
        assert_eq!(
            list_schedule(secs(&[5, 5, 5]), 2),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_list_schedule_arrival_order() {
        // lanes: [1, 10] -> third job waits for the 1s lane
        assert_eq!(list_schedule(secs(&[1, 10, 4]), 2), Duration::from_secs(10));
        // lanes: [10, 1] -> 4s starts at 1, still bounded by 10
        assert_eq!(list_schedule(secs(&[10, 1, 4, 8]), 2), Duration::from_secs(13));
    }

    #[test]
    fn test_list_schedule_edges() {
        assert_eq!(list_schedule(Vec::new(), 3), Duration::ZERO);
        assert_eq!(list_schedule(secs(&[2, 3, 4]), 1), Duration::from_secs(9));
        assert_eq!(list_schedule(secs(&[2, 3, 4]), 8), Duration::from_secs(4));
        // zero lanes behaves like one
        assert_eq!(list_schedule(secs(&[2, 3]), 0), Duration::from_secs(5));
    }

    #[test]
    fn test_subtree_own_then_children() {
        let mut cache = DurationCache::default();
        cache.store("build", Duration::from_secs(4));
        cache.store("a", Duration::from_secs(5));
        cache.store("b", Duration::from_secs(5));
        cache.store("c", Duration::from_secs(5));

        let tree = TaskTree::build(
            vec![TaskSpec::command("build", "build").with_children(vec![
                TaskSpec::command("a", "a"),
                TaskSpec::command("unknown", "never-seen"),
                TaskSpec::command("b", "b"),
                TaskSpec::command("c", "c"),
            ])],
            "",
            &cache,
        );
        let estimator = RuntimeEstimator::new(2);
        let root = tree.roots()[0];
        assert_eq!(estimator.subtree(&tree, root), Duration::from_secs(14));
        assert_eq!(estimator.total(&tree), Duration::from_secs(14));
    }

    #[test]
    fn test_current_eta() {
        let mut cache = DurationCache::default();
        cache.store("sleep 30", Duration::from_secs(30));
        let mut tree = TaskTree::build(
            vec![
                TaskSpec::command("known", "sleep 30"),
                TaskSpec::command("new", "sleep 1"),
            ],
            "",
            &cache,
        );
        let estimator = RuntimeEstimator::new(1);
        let known = tree.roots()[0];
        let start = Instant::now();
        tree.node_mut(known).started_at = Some(start);

        let eta = estimator.current_eta(&tree, known, start + Duration::from_secs(10));
        assert_eq!(eta, Eta::Remaining(Duration::from_secs(20)));
        assert_eq!(
            estimator.current_eta(&tree, tree.roots()[1], start),
            Eta::Unknown
        );
        assert_eq!(Eta::Unknown.to_string(), "Unknown!");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m");
    }
}
