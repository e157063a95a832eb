//! Coalescent interval decomposition.
//!
//! The time axis between the earliest sample and the top of the tree is cut
//! at every node event. Each [`Interval`] records how long it lasted, how many
//! lineages were alive during it and what happened at its upper boundary.
//!
//! Events whose heights differ by at most the multifurcation epsilon form one
//! cluster. Within a cluster, samples come first, then recombinations, then
//! coalescences, so the lineage count never dips below one while a cluster is
//! being processed. Each event kind present in a cluster produces a single
//! interval carrying its `event_count`; later intervals of the same cluster
//! have zero length. [`IntervalList::resolved`] expands multi-event
//! boundaries into unit steps.

use arbora_core::{ArboraError, Result, Summarizable};
use tracing::debug;

use crate::checkpoint::{Checkpointed, Swappable};
use crate::config::IntervalConfig;
use crate::tree::{NodeId, TreeView};

/// What happens at the upper boundary of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntervalType {
    /// Lineages merge.
    Coalescent,
    /// New sampled lineages enter.
    Sample,
    /// Lineages split going backwards in time.
    Recombination,
    /// No lineage change; a demographic change point.
    Nothing,
}

/// One interval of the decomposition.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    pub length: f64,
    pub interval_type: IntervalType,
    /// Lineages alive during the interval.
    pub lineage_count: u32,
    /// Events at the upper boundary. Zero for `Nothing`.
    pub event_count: u32,
}

impl Interval {
    /// Lineages alive just above the interval's upper boundary.
    pub fn lineages_after(&self) -> u32 {
        match self.interval_type {
            IntervalType::Coalescent => self.lineage_count - self.event_count,
            IntervalType::Sample | IntervalType::Recombination => {
                self.lineage_count + self.event_count
            }
            IntervalType::Nothing => self.lineage_count,
        }
    }
}

/// An ordered interval decomposition of a tree.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntervalList {
    intervals: Vec<Interval>,
    start_time: f64,
    initial_lineages: u32,
}

impl IntervalList {
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    pub fn get(&self, i: usize) -> Option<&Interval> {
        self.intervals.get(i)
    }

    pub fn length(&self, i: usize) -> Option<f64> {
        self.get(i).map(|iv| iv.length)
    }

    pub fn interval_type(&self, i: usize) -> Option<IntervalType> {
        self.get(i).map(|iv| iv.interval_type)
    }

    pub fn lineage_count(&self, i: usize) -> Option<u32> {
        self.get(i).map(|iv| iv.lineage_count)
    }

    /// Height of the earliest event.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Lineages present at `start_time`.
    pub fn initial_lineages(&self) -> u32 {
        self.initial_lineages
    }

    /// Sum of all interval lengths.
    pub fn total_duration(&self) -> f64 {
        self.intervals.iter().map(|iv| iv.length).sum()
    }

    /// Height of the last event.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.total_duration()
    }

    /// Number of sampled lineages, including those present at the start.
    pub fn sample_count(&self) -> u32 {
        self.initial_lineages + self.event_total(IntervalType::Sample)
    }

    pub fn coalescence_count(&self) -> u32 {
        self.event_total(IntervalType::Coalescent)
    }

    pub fn recombination_count(&self) -> u32 {
        self.event_total(IntervalType::Recombination)
    }

    /// True when every coalescent boundary merges exactly two lineages.
    pub fn is_binary(&self) -> bool {
        self.intervals
            .iter()
            .filter(|iv| iv.interval_type == IntervalType::Coalescent)
            .all(|iv| iv.event_count == 1)
    }

    /// The decomposition with multi-event boundaries split into unit steps.
    ///
    /// A boundary with `k` events becomes `k` intervals: the first keeps the
    /// original length, the rest have zero length, and the lineage count
    /// moves by one between them.
    pub fn resolved(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals.iter().flat_map(|iv| {
            let iv = *iv;
            let steps = iv.event_count.max(1);
            (0..steps).map(move |k| Interval {
                length: if k == 0 { iv.length } else { 0.0 },
                interval_type: iv.interval_type,
                lineage_count: match iv.interval_type {
                    IntervalType::Coalescent => iv.lineage_count - k,
                    IntervalType::Sample | IntervalType::Recombination => iv.lineage_count + k,
                    IntervalType::Nothing => iv.lineage_count,
                },
                event_count: iv.event_count.min(1),
            })
        })
    }

    /// One height per lineage event: the initial lineages at `start_time`,
    /// then each boundary repeated `event_count` times.
    pub fn event_heights(&self) -> Vec<f64> {
        let mut heights = vec![self.start_time; self.initial_lineages as usize];
        let mut t = self.start_time;
        for iv in &self.intervals {
            t += iv.length;
            heights.extend(std::iter::repeat(t).take(iv.event_count as usize));
        }
        heights
    }

    fn event_total(&self, kind: IntervalType) -> u32 {
        self.intervals
            .iter()
            .filter(|iv| iv.interval_type == kind)
            .map(|iv| iv.event_count)
            .sum()
    }

    fn clear(&mut self) {
        self.intervals.clear();
        self.start_time = 0.0;
        self.initial_lineages = 0;
    }
}

impl Summarizable for IntervalList {
    fn summary(&self) -> String {
        format!(
            "IntervalList: {} intervals over {:.4} ({} coalescences, {} samples)",
            self.interval_count(),
            self.total_duration(),
            self.coalescence_count(),
            self.sample_count()
        )
    }
}

// Order within a cluster: additions, then removals, then change points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    Sample,
    Recombination,
    Coalescent,
    ChangePoint,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    height: f64,
    kind: EventKind,
}

/// Builds [`IntervalList`]s from trees, reusing its scratch buffers.
#[derive(Debug, Clone)]
pub struct IntervalBuilder {
    config: IntervalConfig,
    events: Vec<Event>,
    visited: Vec<bool>,
    excluded: Vec<bool>,
    stack: Vec<NodeId>,
}

impl IntervalBuilder {
    pub fn new(config: IntervalConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            events: Vec::new(),
            visited: Vec::new(),
            excluded: Vec::new(),
            stack: Vec::new(),
        })
    }

    pub fn config(&self) -> &IntervalConfig {
        &self.config
    }

    /// Decompose `tree` into a fresh list.
    pub fn build(&mut self, tree: &dyn TreeView) -> Result<IntervalList> {
        let mut out = IntervalList::default();
        self.build_into(tree, &mut out)?;
        Ok(out)
    }

    /// Decompose `tree` into `out`, reusing its allocation.
    ///
    /// Fails with `InvalidTopology` if a coalescence would leave no lineage
    /// or more than one lineage remains at the top.
    pub fn build_into(&mut self, tree: &dyn TreeView, out: &mut IntervalList) -> Result<()> {
        self.collect(tree)?;
        self.events
            .sort_by(|a, b| a.height.total_cmp(&b.height).then(a.kind.cmp(&b.kind)));
        if self.add_change_points() {
            self.events
                .sort_by(|a, b| a.height.total_cmp(&b.height).then(a.kind.cmp(&b.kind)));
        }
        self.emit(out)
    }

    fn collect(&mut self, tree: &dyn TreeView) -> Result<()> {
        let n = tree.node_count();
        let top = self.config.included_root.unwrap_or_else(|| tree.root());
        if top >= n {
            return Err(ArboraError::InvalidInput(format!(
                "included root {} out of range ({})",
                top, n
            )));
        }

        self.excluded.clear();
        self.excluded.resize(n, false);
        for &x in &self.config.excluded_subtrees {
            if x >= n {
                return Err(ArboraError::InvalidInput(format!(
                    "excluded subtree {} out of range ({})",
                    x, n
                )));
            }
            self.excluded[x] = true;
        }
        self.visited.clear();
        self.visited.resize(n, false);
        self.events.clear();
        self.stack.clear();
        self.stack.push(top);

        while let Some(v) = self.stack.pop() {
            if self.visited[v] {
                continue;
            }
            self.visited[v] = true;

            let height = tree.height(v);
            if !height.is_finite() {
                return Err(ArboraError::nan_at(v, format!("node height {}", height)));
            }
            let mut push = |kind, count: usize| {
                for _ in 0..count {
                    self.events.push(Event { height, kind });
                }
            };

            if v != top {
                push(EventKind::Recombination, tree.parent_count(v).saturating_sub(1));
            }
            if (v != top && self.excluded[v]) || tree.is_external(v) {
                push(EventKind::Sample, 1);
                continue;
            }
            let children = tree.child_count(v);
            push(EventKind::Coalescent, children.saturating_sub(1));
            for i in 0..children {
                self.stack.push(tree.child(v, i));
            }
        }
        Ok(())
    }

    /// Append change points strictly inside the event span that do not
    /// coincide with an existing event. Expects sorted events.
    fn add_change_points(&mut self) -> bool {
        let eps = self.config.multifurcation_epsilon;
        let (Some(first), Some(last)) = (self.events.first(), self.events.last()) else {
            return false;
        };
        let (lo, hi) = (first.height, last.height);
        let node_events = self.events.len();
        for &t in &self.config.change_points {
            if t <= lo + eps || t >= hi - eps {
                continue;
            }
            let idx = self.events[..node_events].partition_point(|e| e.height < t - eps);
            if idx < node_events && self.events[idx].height <= t + eps {
                continue;
            }
            self.events.push(Event {
                height: t,
                kind: EventKind::ChangePoint,
            });
        }
        self.events.len() > node_events
    }

    fn emit(&self, out: &mut IntervalList) -> Result<()> {
        out.clear();
        let Some(first) = self.events.first() else {
            return Err(ArboraError::topology("tree has no events"));
        };
        let eps = self.config.multifurcation_epsilon;
        let start = first.height;
        out.start_time = start;

        let mut lines: u32 = 0;
        let mut prev = start;
        let mut i = 0;
        let mut first_cluster = true;

        while i < self.events.len() {
            let finish = self.events[i].height;
            let mut counts = [0u32; 4];
            while i < self.events.len() && (self.events[i].height - finish).abs() <= eps {
                counts[self.events[i].kind as usize] += 1;
                i += 1;
            }
            let [samples, recombinations, coalescences, marks] = counts;

            if first_cluster {
                // Lineages present at the start open no interval.
                lines = samples + recombinations;
                out.initial_lineages = lines;
            } else {
                for (interval_type, count) in [
                    (IntervalType::Sample, samples),
                    (IntervalType::Recombination, recombinations),
                ] {
                    if count > 0 {
                        out.intervals.push(Interval {
                            length: finish - prev,
                            interval_type,
                            lineage_count: lines,
                            event_count: count,
                        });
                        lines += count;
                        prev = finish;
                    }
                }
            }

            if coalescences > 0 {
                if lines <= coalescences {
                    return Err(ArboraError::topology(format!(
                        "{} coalescences at height {} with only {} lineages",
                        coalescences, finish, lines
                    )));
                }
                out.intervals.push(Interval {
                    length: finish - prev,
                    interval_type: IntervalType::Coalescent,
                    lineage_count: lines,
                    event_count: coalescences,
                });
                lines -= coalescences;
                prev = finish;
            } else if marks > 0 && samples + recombinations == 0 {
                out.intervals.push(Interval {
                    length: finish - prev,
                    interval_type: IntervalType::Nothing,
                    lineage_count: lines,
                    event_count: 0,
                });
                prev = finish;
            }
            first_cluster = false;
        }

        if lines != 1 {
            return Err(ArboraError::topology(format!(
                "{} lineages remain at the top of the tree",
                lines
            )));
        }
        Ok(())
    }
}

/// A checkpointed, lazily rebuilt interval decomposition of one tree.
#[derive(Debug, Clone)]
pub struct TreeIntervals {
    builder: IntervalBuilder,
    list: Swappable<IntervalList>,
    known: Swappable<bool>,
    rebuilds: u64,
}

impl TreeIntervals {
    pub fn new(config: IntervalConfig) -> Result<Self> {
        Ok(Self {
            builder: IntervalBuilder::new(config)?,
            list: Swappable::new(IntervalList::default()),
            known: Swappable::new(false),
            rebuilds: 0,
        })
    }

    /// Force a rebuild on next access.
    pub fn invalidate(&mut self) {
        if *self.known.get() {
            self.known.set(false);
        }
    }

    pub fn is_known(&self) -> bool {
        *self.known.get()
    }

    /// The current list, if it does not need rebuilding.
    pub fn current(&self) -> Option<&IntervalList> {
        self.is_known().then(|| self.list.get())
    }

    /// Number of full rebuilds so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// The decomposition of `tree`, rebuilding it if stale.
    pub fn intervals(&mut self, tree: &dyn TreeView) -> Result<&IntervalList> {
        if !*self.known.get() {
            let list = self.list.overwrite();
            self.builder.build_into(tree, list)?;
            self.known.set(true);
            self.rebuilds += 1;
            debug!(
                intervals = self.list.get().interval_count(),
                rebuilds = self.rebuilds,
                "rebuilt tree intervals"
            );
        }
        Ok(self.list.get())
    }
}

impl Checkpointed for TreeIntervals {
    fn begin(&mut self) {
        self.list.begin();
        self.known.begin();
    }

    fn commit(&mut self) {
        self.list.commit();
        self.known.commit();
    }

    fn rollback(&mut self) {
        self.list.rollback();
        self.known.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TimeTree;

    fn builder() -> IntervalBuilder {
        IntervalBuilder::new(IntervalConfig::default()).unwrap()
    }

    fn sample_tree() -> TimeTree {
        // ((A@0,B@0.2)AB@1,(C@0,D@0.5)CD@1.5)root@3
        let mut tree = TimeTree::new(3.0);
        let ab = tree.add_child(0, Some("AB".into()), 1.0).unwrap();
        let cd = tree.add_child(0, Some("CD".into()), 1.5).unwrap();
        tree.add_child(ab, Some("A".into()), 0.0).unwrap();
        tree.add_child(ab, Some("B".into()), 0.2).unwrap();
        tree.add_child(cd, Some("C".into()), 0.0).unwrap();
        tree.add_child(cd, Some("D".into()), 0.5).unwrap();
        tree
    }

    fn polytomy_tree() -> TimeTree {
        // ((A,B)@1, C, D)@2, all tips at 0
        let mut tree = TimeTree::new(2.0);
        let ab = tree.add_child(0, None, 1.0).unwrap();
        tree.add_child(ab, Some("A".into()), 0.0).unwrap();
        tree.add_child(ab, Some("B".into()), 0.0).unwrap();
        tree.add_child(0, Some("C".into()), 0.0).unwrap();
        tree.add_child(0, Some("D".into()), 0.0).unwrap();
        tree
    }

    fn iv(length: f64, interval_type: IntervalType, lineage_count: u32, event_count: u32) -> Interval {
        Interval {
            length,
            interval_type,
            lineage_count,
            event_count,
        }
    }

    #[test]
    fn serial_samples() {
        let list = builder().build(&sample_tree()).unwrap();
        assert_eq!(list.initial_lineages(), 2);
        assert_eq!(list.start_time(), 0.0);
        let expected = [
            iv(0.2, IntervalType::Sample, 2, 1),
            iv(0.3, IntervalType::Sample, 3, 1),
            iv(0.5, IntervalType::Coalescent, 4, 1),
            iv(0.5, IntervalType::Coalescent, 3, 1),
            iv(1.5, IntervalType::Coalescent, 2, 1),
        ];
        assert_eq!(list.interval_count(), expected.len());
        for (got, want) in list.iter().zip(expected.iter()) {
            assert!((got.length - want.length).abs() < 1e-12, "{:?}", got);
            assert_eq!(got.interval_type, want.interval_type);
            assert_eq!(got.lineage_count, want.lineage_count);
            assert_eq!(got.event_count, want.event_count);
        }
        assert!((list.total_duration() - 3.0).abs() < 1e-12);
        assert_eq!(list.sample_count(), 4);
        assert_eq!(list.coalescence_count(), 3);
        assert_eq!(list.recombination_count(), 0);
        assert!(list.is_binary());
    }

    #[test]
    fn root_polytomy_is_one_boundary() {
        let list = builder().build(&polytomy_tree()).unwrap();
        assert_eq!(
            list.intervals(),
            &[
                iv(1.0, IntervalType::Coalescent, 4, 1),
                iv(1.0, IntervalType::Coalescent, 3, 2),
            ]
        );
        assert_eq!(list.length(1), Some(1.0));
        assert_eq!(list.lineage_count(1), Some(3));
        assert_eq!(list.interval_type(2), None);
        assert!(!list.is_binary());
    }

    #[test]
    fn resolved_view_steps_by_one() {
        let list = builder().build(&polytomy_tree()).unwrap();
        let resolved: Vec<Interval> = list.resolved().collect();
        assert_eq!(
            resolved,
            vec![
                iv(1.0, IntervalType::Coalescent, 4, 1),
                iv(1.0, IntervalType::Coalescent, 3, 1),
                iv(0.0, IntervalType::Coalescent, 2, 1),
            ]
        );
        for pair in resolved.windows(2) {
            assert_eq!(pair[0].lineages_after(), pair[1].lineage_count);
        }
        assert_eq!(resolved.last().unwrap().lineages_after(), 1);
    }

    #[test]
    fn event_heights_cover_every_lineage_event() {
        let list = builder().build(&polytomy_tree()).unwrap();
        assert_eq!(list.event_heights(), vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn near_coincident_heights_merge() {
        let mut tree = polytomy_tree();
        tree.set_height(1, 2.0 - 1e-12).unwrap();
        let list = builder().build(&tree).unwrap();
        assert_eq!(list.interval_count(), 1);
        assert_eq!(list.get(0).unwrap().event_count, 3);
        assert_eq!(list.get(0).unwrap().lineage_count, 4);
    }

    #[test]
    fn single_tip_has_no_intervals() {
        let tree = TimeTree::new(0.0);
        let list = builder().build(&tree).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.initial_lineages(), 1);
        assert_eq!(list.event_heights(), vec![0.0]);
    }

    #[test]
    fn recombination_adds_a_lineage() {
        // A recombines at 0.5; one side joins B at 1, the other meets it at 2.
        let mut tree = TimeTree::new(2.0);
        let p1 = tree.add_child(0, None, 1.0).unwrap();
        let r = tree.add_child(p1, None, 0.5).unwrap();
        tree.add_child(p1, Some("B".into()), 0.0).unwrap();
        tree.add_child(r, Some("A".into()), 0.0).unwrap();
        tree.add_second_parent(r, 0).unwrap();

        let list = builder().build(&tree).unwrap();
        assert_eq!(
            list.intervals(),
            &[
                iv(0.5, IntervalType::Recombination, 2, 1),
                iv(0.5, IntervalType::Coalescent, 3, 1),
                iv(1.0, IntervalType::Coalescent, 2, 1),
            ]
        );
        assert_eq!(list.recombination_count(), 1);
    }

    #[test]
    fn excluded_subtree_is_a_single_sample() {
        let config = IntervalConfig {
            excluded_subtrees: vec![2],
            ..IntervalConfig::default()
        };
        let list = IntervalBuilder::new(config)
            .unwrap()
            .build(&sample_tree())
            .unwrap();
        let types: Vec<IntervalType> = list.iter().map(|iv| iv.interval_type).collect();
        assert_eq!(
            types,
            vec![
                IntervalType::Sample,
                IntervalType::Coalescent,
                IntervalType::Sample,
                IntervalType::Coalescent,
            ]
        );
        assert_eq!(list.sample_count(), 3);
        assert!((list.total_duration() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn included_root_limits_the_region() {
        let config = IntervalConfig {
            included_root: Some(2),
            ..IntervalConfig::default()
        };
        let list = IntervalBuilder::new(config)
            .unwrap()
            .build(&sample_tree())
            .unwrap();
        assert_eq!(
            list.intervals(),
            &[
                iv(0.5, IntervalType::Sample, 1, 1),
                iv(1.0, IntervalType::Coalescent, 2, 1),
            ]
        );
    }

    #[test]
    fn change_points_insert_empty_boundaries() {
        let config = IntervalConfig {
            // 0.2 coincides with a sample and 5.0 lies above the root.
            change_points: vec![2.0, 0.2, 5.0],
            ..IntervalConfig::default()
        };
        let list = IntervalBuilder::new(config)
            .unwrap()
            .build(&sample_tree())
            .unwrap();
        assert_eq!(list.interval_count(), 6);
        let nothing = list.get(4).unwrap();
        assert_eq!(nothing.interval_type, IntervalType::Nothing);
        assert_eq!(nothing.lineage_count, 2);
        assert_eq!(nothing.event_count, 0);
        assert!((nothing.length - 0.5).abs() < 1e-12);
        assert!((list.length(5).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn parent_below_child_is_invalid_topology() {
        let mut tree = TimeTree::new(1.0);
        tree.add_child(0, Some("A".into()), 0.0).unwrap();
        tree.add_child(0, Some("B".into()), 2.0).unwrap();
        let err = builder().build(&tree).unwrap_err();
        assert!(matches!(err, ArboraError::InvalidTopology(_)));
    }

    #[test]
    fn non_finite_height_is_an_anomaly() {
        let mut tree = sample_tree();
        tree.set_height(4, f64::NAN).unwrap();
        let err = builder().build(&tree).unwrap_err();
        assert!(matches!(
            err,
            ArboraError::NumericalAnomaly { node: Some(4), .. }
        ));
    }

    #[test]
    fn out_of_range_exclusion_is_rejected() {
        let config = IntervalConfig {
            excluded_subtrees: vec![99],
            ..IntervalConfig::default()
        };
        assert!(IntervalBuilder::new(config)
            .unwrap()
            .build(&sample_tree())
            .is_err());
    }

    #[test]
    fn summary_format() {
        let list = builder().build(&polytomy_tree()).unwrap();
        assert_eq!(
            list.summary(),
            "IntervalList: 2 intervals over 2.0000 (3 coalescences, 4 samples)"
        );
    }

    #[test]
    fn tree_intervals_rebuild_lazily() {
        let mut tree = sample_tree();
        let mut holder = TreeIntervals::new(IntervalConfig::default()).unwrap();
        assert!(holder.current().is_none());
        holder.intervals(&tree).unwrap();
        holder.intervals(&tree).unwrap();
        assert_eq!(holder.rebuild_count(), 1);

        tree.set_height(0, 4.0).unwrap();
        holder.invalidate();
        let total = holder.intervals(&tree).unwrap().total_duration();
        assert!((total - 4.0).abs() < 1e-12);
        assert_eq!(holder.rebuild_count(), 2);
    }

    #[test]
    fn tree_intervals_rollback_restores_list() {
        let mut tree = sample_tree();
        let mut holder = TreeIntervals::new(IntervalConfig::default()).unwrap();
        let before = holder.intervals(&tree).unwrap().clone();

        holder.begin();
        tree.set_height(0, 6.0).unwrap();
        holder.invalidate();
        assert!((holder.intervals(&tree).unwrap().total_duration() - 6.0).abs() < 1e-12);
        holder.rollback();

        assert!(holder.is_known());
        assert_eq!(holder.current(), Some(&before));
    }
}
