//! Marking driver.
//!
//! [Marker] runs one marking episode over a [HeapBase]: roots are seeded through
//! [Marker::mark_roots] and friends, the worklists are drained either incrementally
//! ([Marker::advance_marking]) or by a group of parallel tasks
//! ([Marker::process_worklists]), and [Marker::finish_marking] settles objects that are
//! still in construction and runs the weak callbacks.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{
    header::{AccessMode, HeapObjectHeader},
    heap::HeapBase,
    internal::trace_trait::{BaseObject, TraceDescriptor},
    liveness_broker::LivenessBrokerFactory,
    marking::{MarkingVisitor, WeakRootsMarkingVisitor},
    marking_state::MarkingState,
    marking_worklists::MarkingWorklists,
    visitor::Visitor,
    Config,
};

/// Result of a marking episode.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MarkingStats {
    pub marked_bytes: usize,
    pub marked_objects: usize,
    pub weak_callbacks_invoked: usize,
    pub not_fully_constructed_deferred: usize,
    /// Number of trace callbacks run.
    pub steps: usize,
}

impl MarkingStats {
    fn absorb(&mut self, state: &MarkingState<'_>, steps: usize) {
        self.marked_bytes += state.marked_bytes();
        self.marked_objects += state.marked_objects();
        self.weak_callbacks_invoked += state.weak_callbacks_invoked();
        self.not_fully_constructed_deferred += state.not_fully_constructed_pushed();
        self.steps += steps;
    }

    fn merge(&mut self, other: &MarkingStats) {
        self.marked_bytes += other.marked_bytes;
        self.marked_objects += other.marked_objects;
        self.weak_callbacks_invoked += other.weak_callbacks_invoked;
        self.not_fully_constructed_deferred += other.not_fully_constructed_deferred;
        self.steps += other.steps;
    }
}

/// Draining barrier for parallel marking tasks.
///
/// A task that runs dry leaves the barrier and waits. It rejoins as soon as another
/// task publishes a segment to the marking worklist, because that work may be all
/// that is left. Marking is over once every task left at the same time.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: CachePadded<AtomicUsize>,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: CachePadded::new(AtomicUsize::new(number_workers)),
        }
    }

    /// Called by a task that ran out of work after publishing its local segments.
    /// Returns true once every task ran out of work, false if the caller rejoined
    /// because `has_global_work` reported new segments.
    pub fn try_terminate(&self, has_global_work: impl Fn() -> bool) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1 {
            return true;
        }

        let backoff = Backoff::new();
        loop {
            if self.nworkers.load(Ordering::Acquire) == 0 {
                return true;
            }
            if has_global_work() && self.rejoin() {
                return false;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Re-enters the barrier unless every task already left it.
    fn rejoin(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);
        while nworkers != 0 {
            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => nworkers = actual,
            }
        }
        false
    }
}

/// Local items are published once the shared pool is empty and at least this many are
/// held, so idle tasks can steal them.
const PUBLISH_THRESHOLD: usize = 16;

pub struct Marker<'h> {
    heap: &'h HeapBase,
    config: Config,
    worklists: MarkingWorklists,
    stats: MarkingStats,
    in_progress: bool,
}

impl<'h> Marker<'h> {
    pub fn new(heap: &'h HeapBase, config: Config) -> Self {
        Self {
            heap,
            config,
            worklists: MarkingWorklists::new(),
            stats: MarkingStats::default(),
            in_progress: false,
        }
    }

    pub fn heap(&self) -> &'h HeapBase {
        self.heap
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worklists(&self) -> &MarkingWorklists {
        &self.worklists
    }

    /// Statistics of the current episode so far.
    pub fn stats(&self) -> MarkingStats {
        self.stats
    }

    pub fn is_marking(&self) -> bool {
        self.in_progress
    }

    /// Starts a new episode: clears every mark bit, the worklists and the counters.
    pub fn start_marking(&mut self) {
        log::debug!("start marking with {} task(s)", self.config.marking_tasks);
        self.heap.reset_marks();
        self.worklists.clear();
        self.stats = MarkingStats::default();
        self.in_progress = true;
    }

    /// Marks every root header and queues it for tracing.
    pub fn mark_roots(&mut self, roots: &[*const HeapObjectHeader]) {
        debug_assert!(self.in_progress);
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        for &root in roots {
            if root.is_null() {
                continue;
            }
            state.mark_and_push_header_from_gc_info(unsafe { &*root });
        }
        self.stats.absorb(&state, 0);
    }

    pub fn mark_root_payload(&mut self, payload: *const u8) {
        if payload.is_null() {
            return;
        }
        let header = self.heap.header_from_payload(payload);
        self.mark_roots(&[header as *const HeapObjectHeader]);
    }

    /// Treats every word in `[from, to)` as a potential root.
    pub fn scan_conservatively(&mut self, from: *const u8, to: *const u8) {
        debug_assert!(self.in_progress);
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        state.mark_conservatively(from.cast(), to.cast());
        self.stats.absorb(&state, 0);
    }

    /// Lets the caller trace roots that are not heap objects themselves.
    pub fn visit_roots(&mut self, f: impl FnOnce(&mut Visitor<'_>)) {
        debug_assert!(self.in_progress);
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        {
            let mut vis = MarkingVisitor::new(&mut state);
            f(&mut Visitor::new(&mut vis));
        }
        self.stats.absorb(&state, 0);
    }

    /// The object at `payload` finished its constructor. It is queued again so that the
    /// next drain traces it unless it was marked already.
    pub fn notify_construction_complete(&mut self, payload: *const u8) {
        let header = match self.heap.object_header_from_inner_address(payload) {
            Some(header) => header,
            None => return,
        };
        debug_assert!(!header.is_in_construction(AccessMode::Atomic));
        log::trace!("construction of {:p} complete", header.payload());
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        state.mark_and_push_header_from_gc_info(header);
        self.stats.absorb(&state, 0);
    }

    /// Traces at most `step_limit` objects on the calling thread. Returns true when
    /// there is no marking work left.
    pub fn advance_marking(&mut self, step_limit: usize) -> bool {
        debug_assert!(self.in_progress);
        // A zero limit still traces one object.
        let step_limit = step_limit.max(1);
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        let mut steps = 0;
        let mut done = false;
        while steps < step_limit {
            match state.pop_marking() {
                Some(item) => {
                    trace_item(&mut state, item);
                    steps += 1;
                }
                None => {
                    if !flush_not_fully_constructed(&mut state) {
                        done = true;
                        break;
                    }
                }
            }
        }
        self.stats.absorb(&state, steps);
        log::debug!("incremental step traced {} object(s), done: {}", steps, done);
        done
    }

    /// One incremental step of `Config::step_size` objects.
    pub fn step(&mut self) -> bool {
        self.advance_marking(self.config.step_size)
    }

    /// Drains the worklists with `Config::marking_tasks` tasks until no marking work is
    /// left. Deferred objects that completed construction in the meantime are traced,
    /// the others stay deferred.
    pub fn process_worklists(&mut self) {
        debug_assert!(self.in_progress);
        let tasks = self.config.marking_tasks.max(1);
        loop {
            let stats = if tasks == 1 {
                let terminator = Terminator::new(1);
                drain(self.heap, &self.worklists, &terminator, 0)
            } else {
                self.drain_parallel(tasks)
            };
            self.stats.merge(&stats);

            let mut state = MarkingState::new(self.heap, &self.worklists, 0);
            let pushed = flush_not_fully_constructed(&mut state);
            self.stats.absorb(&state, 0);
            if !pushed {
                break;
            }
        }
    }

    fn drain_parallel(&self, tasks: usize) -> MarkingStats {
        let terminator = Terminator::new(tasks);
        let heap = self.heap;
        let worklists = &self.worklists;
        let result = crossbeam_utils::thread::scope(|scope| {
            let handles = (0..tasks)
                .map(|task_id| {
                    let terminator = &terminator;
                    scope.spawn(move |_| drain(heap, worklists, terminator, task_id))
                })
                .collect::<Vec<_>>();
            let mut stats = MarkingStats::default();
            for handle in handles {
                match handle.join() {
                    Ok(task_stats) => stats.merge(&task_stats),
                    Err(err) => std::panic::resume_unwind(err),
                }
            }
            stats
        });
        match result {
            Ok(stats) => stats,
            Err(err) => std::panic::resume_unwind(err),
        }
    }

    /// Completes marking, objects in construction included, and then resolves weak
    /// roots right away.
    pub fn visit_weak_roots(&mut self, f: impl FnOnce(&mut Visitor<'_>)) {
        debug_assert!(self.in_progress);
        self.settle_in_construction();
        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        {
            let mut vis = WeakRootsMarkingVisitor::new(&mut state);
            f(&mut Visitor::new(&mut vis));
        }
        self.stats.absorb(&state, 0);
        drop(state);
        self.process_worklists();
    }

    /// Drains to a fixpoint. Objects still in construction afterwards are marked,
    /// accounted and scanned conservatively, so the not fully constructed worklist ends
    /// up empty.
    fn settle_in_construction(&mut self) {
        loop {
            self.process_worklists();
            let mut state = MarkingState::new(self.heap, &self.worklists, 0);
            let mut scanned = 0;
            while let Some(item) = state.pop_not_fully_constructed() {
                let header = match self.heap.object_header_from_inner_address(item.0) {
                    Some(header) if !header.is_free() => header,
                    _ => continue,
                };
                if state.mark_no_push(header) {
                    state.account_marked_bytes(header);
                    let (from, to) = MarkingState::payload_words(header);
                    state.mark_conservatively(from, to);
                    scanned += 1;
                }
            }
            log::debug!("scanned {} object(s) in construction conservatively", scanned);
            self.stats.absorb(&state, 0);
            drop(state);
            if scanned == 0 {
                break;
            }
        }
    }

    /// Finishes the episode. Objects still in construction are kept alive and scanned
    /// conservatively, then every registered weak callback runs exactly once.
    pub fn finish_marking(&mut self) -> MarkingStats {
        debug_assert!(self.in_progress);
        self.settle_in_construction();

        let mut state = MarkingState::new(self.heap, &self.worklists, 0);
        let broker = LivenessBrokerFactory::create();
        while let Some(item) = state.pop_weak_callback() {
            (item.callback)(&broker, item.parameter);
            state.count_weak_callback_invoked();
        }
        self.stats.absorb(&state, 0);
        drop(state);

        self.in_progress = false;
        let stats = self.stats;
        logln_if!(
            self.config.verbose,
            "marking finished: {} object(s), {} byte(s), {} weak callback(s), {} deferral(s)",
            stats.marked_objects,
            stats.marked_bytes,
            stats.weak_callbacks_invoked,
            stats.not_fully_constructed_deferred
        );
        stats
    }
}

fn trace_item(state: &mut MarkingState<'_>, item: TraceDescriptor) {
    let payload = match item.base_object {
        BaseObject::Payload(payload) => payload,
        BaseObject::NotFullyConstructed => {
            debug_assert!(false, "not fully constructed descriptor on the marking worklist");
            return;
        }
    };
    let header = unsafe { &*state.heap().header_from_payload(payload) };
    debug_assert!(header.is_marked(AccessMode::Atomic));
    state.account_marked_bytes(header);
    let mut vis = MarkingVisitor::new(state);
    (item.callback)(&mut Visitor::new(&mut vis), payload);
}

/// Re-checks every deferred entry. Objects that finished construction are marked and
/// queued, the rest are put back. Returns whether anything was queued.
fn flush_not_fully_constructed(state: &mut MarkingState<'_>) -> bool {
    let heap = state.heap();
    let mut retained = Vec::new();
    let mut pushed = false;
    while let Some(item) = state.pop_not_fully_constructed() {
        let header = match heap.object_header_from_inner_address(item.0) {
            Some(header) if !header.is_free() => header,
            _ => continue,
        };
        if header.is_in_construction(AccessMode::Atomic) {
            retained.push(item);
        } else if !header.is_marked(AccessMode::Atomic) {
            state.mark_and_push_header_from_gc_info(header);
            pushed = true;
        }
    }
    for item in retained {
        state.retain_not_fully_constructed(item);
    }
    pushed
}

fn drain(
    heap: &HeapBase,
    worklists: &MarkingWorklists,
    terminator: &Terminator,
    task_id: usize,
) -> MarkingStats {
    let mut state = MarkingState::new(heap, worklists, task_id);
    let mut steps = 0;
    loop {
        while let Some(item) = state.pop_marking() {
            trace_item(&mut state, item);
            steps += 1;
            if state.local_marking_size() >= PUBLISH_THRESHOLD
                && worklists.marking_worklist().is_global_empty()
            {
                state.publish();
            }
        }
        state.publish();
        if !worklists.marking_worklist().is_global_empty() {
            continue;
        }
        if terminator.try_terminate(|| !worklists.marking_worklist().is_global_empty()) {
            break;
        }
    }
    log::trace!("task {} traced {} object(s)", task_id, steps);
    let mut stats = MarkingStats::default();
    stats.absorb(&state, steps);
    stats
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn single_task_terminates_at_once() {
        let terminator = Terminator::new(1);
        assert!(terminator.try_terminate(|| true));
    }

    #[test]
    fn idle_task_rejoins_while_work_is_published() {
        let terminator = Terminator::new(2);
        let published = AtomicBool::new(false);
        crossbeam_utils::thread::scope(|scope| {
            let idle =
                scope.spawn(|_| terminator.try_terminate(|| published.load(Ordering::Acquire)));
            published.store(true, Ordering::Release);
            assert!(!idle.join().unwrap());
            published.store(false, Ordering::Release);

            let first = scope.spawn(|_| terminator.try_terminate(|| false));
            let second = scope.spawn(|_| terminator.try_terminate(|| false));
            assert!(first.join().unwrap());
            assert!(second.join().unwrap());
        })
        .unwrap();
    }
}
