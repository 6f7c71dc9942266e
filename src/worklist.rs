//! Segmented work-stealing friendly worklist.
//!
//! A [Worklist] only holds a queue of full (or published) segments. Every marking task
//! works on its own [View] which keeps a private push and pop segment, so the shared
//! queue is only touched when a segment overflows or runs dry.

use std::mem;

use crossbeam::queue::SegQueue;

pub struct Worklist<T, const SEGMENT_SIZE: usize> {
    global_pool: SegQueue<Vec<T>>,
}

impl<T, const SEGMENT_SIZE: usize> Worklist<T, SEGMENT_SIZE> {
    pub fn new() -> Self {
        Self {
            global_pool: SegQueue::new(),
        }
    }

    /// Creates the local view for task `task_id`.
    pub fn view(&self, task_id: usize) -> View<'_, T, SEGMENT_SIZE> {
        View {
            worklist: self,
            task_id,
            push_segment: Vec::with_capacity(SEGMENT_SIZE),
            pop_segment: Vec::new(),
        }
    }

    /// Number of segments published to the global pool.
    pub fn global_pool_size(&self) -> usize {
        self.global_pool.len()
    }

    /// Whether no published segment is waiting. Local segments of live views are not
    /// visible here.
    pub fn is_global_empty(&self) -> bool {
        self.global_pool.is_empty()
    }

    /// Drops all published segments.
    pub fn clear(&self) {
        while self.global_pool.pop().is_some() {}
    }

    fn push_segment(&self, segment: Vec<T>) {
        debug_assert!(!segment.is_empty());
        self.global_pool.push(segment);
    }

    fn pop_segment(&self) -> Option<Vec<T>> {
        self.global_pool.pop()
    }
}

impl<T, const SEGMENT_SIZE: usize> Default for Worklist<T, SEGMENT_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per task window into a [Worklist].
///
/// Items stay private until the push segment is full or [View::publish] is called.
/// Dropping a view publishes whatever it still holds.
pub struct View<'a, T, const SEGMENT_SIZE: usize> {
    worklist: &'a Worklist<T, SEGMENT_SIZE>,
    task_id: usize,
    push_segment: Vec<T>,
    pop_segment: Vec<T>,
}

impl<'a, T, const SEGMENT_SIZE: usize> View<'a, T, SEGMENT_SIZE> {
    pub fn task_id(&self) -> usize {
        self.task_id
    }

    pub fn worklist(&self) -> &'a Worklist<T, SEGMENT_SIZE> {
        self.worklist
    }

    pub fn push(&mut self, item: T) {
        if self.push_segment.len() >= SEGMENT_SIZE {
            self.publish_push_segment();
        }
        self.push_segment.push(item);
    }

    /// Pops from the local segments first and steals a published segment otherwise.
    /// `None` only means nothing was found right now; another task may still publish.
    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.pop_segment.pop() {
            return Some(item);
        }
        if !self.push_segment.is_empty() {
            mem::swap(&mut self.push_segment, &mut self.pop_segment);
            return self.pop_segment.pop();
        }
        match self.worklist.pop_segment() {
            Some(segment) => {
                self.pop_segment = segment;
                self.pop_segment.pop()
            }
            None => None,
        }
    }

    pub fn is_local_empty(&self) -> bool {
        self.push_segment.is_empty() && self.pop_segment.is_empty()
    }

    pub fn local_size(&self) -> usize {
        self.push_segment.len() + self.pop_segment.len()
    }

    /// Makes all locally held items visible to other tasks.
    pub fn publish(&mut self) {
        if !self.push_segment.is_empty() {
            self.publish_push_segment();
        }
        if !self.pop_segment.is_empty() {
            let segment = mem::take(&mut self.pop_segment);
            self.worklist.push_segment(segment);
        }
    }

    fn publish_push_segment(&mut self) {
        let segment = mem::replace(&mut self.push_segment, Vec::with_capacity(SEGMENT_SIZE));
        self.worklist.push_segment(segment);
    }
}

impl<'a, T, const SEGMENT_SIZE: usize> Drop for View<'a, T, SEGMENT_SIZE> {
    fn drop(&mut self) {
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn local_push_pop() {
        let worklist = Worklist::<usize, 4>::new();
        let mut view = worklist.view(0);
        assert!(view.pop().is_none());
        for i in 0..3 {
            view.push(i);
        }
        assert!(worklist.is_global_empty());
        assert_eq!(view.local_size(), 3);
        let mut seen = vec![];
        while let Some(i) = view.pop() {
            seen.push(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(view.is_local_empty());
    }

    #[test]
    fn full_segments_are_published() {
        let worklist = Worklist::<usize, 4>::new();
        let mut producer = worklist.view(0);
        for i in 0..9 {
            producer.push(i);
        }
        assert_eq!(worklist.global_pool_size(), 2);

        let mut consumer = worklist.view(1);
        let mut stolen = 0;
        while consumer.pop().is_some() {
            stolen += 1;
        }
        assert_eq!(stolen, 8);
        assert_eq!(producer.local_size(), 1);
    }

    #[test]
    fn dropping_a_view_loses_nothing() {
        let worklist = Worklist::<usize, 16>::new();
        {
            let mut view = worklist.view(0);
            view.push(1);
            view.push(2);
        }
        assert!(!worklist.is_global_empty());
        let mut view = worklist.view(1);
        let mut items = vec![view.pop(), view.pop(), view.pop()];
        items.sort_unstable();
        assert_eq!(items, vec![None, Some(1), Some(2)]);
    }

    #[test]
    fn clear_drops_published_segments() {
        let worklist = Worklist::<usize, 2>::new();
        {
            let mut view = worklist.view(0);
            for i in 0..5 {
                view.push(i);
            }
        }
        assert!(!worklist.is_global_empty());
        worklist.clear();
        assert!(worklist.is_global_empty());
        assert!(worklist.view(0).pop().is_none());
    }

    #[test]
    fn concurrent_tasks_deliver_every_item_once() {
        const TASKS: usize = 4;
        const PER_TASK: usize = 10_000;
        let worklist = Worklist::<usize, 32>::new();
        crossbeam_utils::thread::scope(|s| {
            for task in 0..TASKS {
                let worklist = &worklist;
                s.spawn(move |_| {
                    let mut view = worklist.view(task);
                    for i in 0..PER_TASK {
                        view.push(task * PER_TASK + i);
                    }
                });
            }
        })
        .unwrap();

        let popped = crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = (0..TASKS)
                .map(|task| {
                    let worklist = &worklist;
                    s.spawn(move |_| {
                        let mut view = worklist.view(task);
                        let mut items = vec![];
                        while let Some(item) = view.pop() {
                            items.push(item);
                        }
                        items
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        assert_eq!(popped.len(), TASKS * PER_TASK);
        let unique: HashSet<_> = popped.into_iter().collect();
        assert_eq!(unique.len(), TASKS * PER_TASK);
        assert!(worklist.is_global_empty());
    }
}
