use nix::unistd::Pid;
use std::collections::VecDeque;

/// How many times a worker can be migrated over before it is killed
/// unconditionally instead of being allowed to keep draining.
pub const MAX_MIGRATE_BACKLOG: usize = 4;

/// Bounded FIFO of retiring-worker generations. Generation 0 holds the most
/// recently retired cohort; higher indexes are older. Each generation has one
/// slot per configured copy.
///
/// Invariant: a pid occupies at most one (generation, slot) pair, and is
/// never simultaneously in here and in the active slot table.
#[derive(Debug)]
pub struct RetireQueue {
    copies: usize,
    generations: VecDeque<Vec<Option<Pid>>>,
}

impl RetireQueue {
    pub fn new(copies: usize) -> Self {
        let generations = (0..MAX_MIGRATE_BACKLOG)
            .map(|_| vec![None; copies])
            .collect();
        RetireQueue { copies, generations }
    }

    pub fn depth(&self) -> usize {
        self.generations.len()
    }

    /// Remove and return every pid in the given generation, oldest being
    /// `MAX_MIGRATE_BACKLOG - 1`.
    pub fn drain_generation(&mut self, generation: usize) -> Vec<Pid> {
        self.generations[generation]
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    /// Age every generation by one step. The oldest generation must have been
    /// drained first; generation 0 comes out empty, ready for the cohort
    /// retired by the migration in progress.
    pub fn shift(&mut self) {
        let dropped = self
            .generations
            .pop_back()
            .expect("retire queue always holds MAX_MIGRATE_BACKLOG generations");
        debug_assert!(
            dropped.iter().all(Option::is_none),
            "shifted out a generation that still holds pids"
        );
        self.generations.push_front(vec![None; self.copies]);
    }

    /// Place a freshly retired worker into generation 0.
    pub fn retire(&mut self, slot: usize, pid: Pid) {
        let front = self
            .generations
            .front_mut()
            .expect("retire queue always holds MAX_MIGRATE_BACKLOG generations");
        debug_assert!(front[slot].is_none(), "generation 0 slot already occupied");
        front[slot] = Some(pid);
    }

    /// Clear one occurrence of `pid`, wherever it sits. Returns false when
    /// the pid is not backlogged; that is not an error, the worker may have
    /// already been force-killed.
    pub fn clear(&mut self, pid: Pid) -> bool {
        for generation in &mut self.generations {
            for entry in generation.iter_mut() {
                if *entry == Some(pid) {
                    *entry = None;
                    return true;
                }
            }
        }
        false
    }

    /// All backlogged pids, youngest generation first.
    pub fn pids(&self) -> Vec<Pid> {
        self.generations
            .iter()
            .flat_map(|g| g.iter().copied().flatten())
            .collect()
    }

    pub fn occupied(&self) -> usize {
        self.generations
            .iter()
            .map(|g| g.iter().filter(|e| e.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Snapshot of one generation's slots, for inspection.
    pub fn generation(&self, generation: usize) -> &[Option<Pid>] {
        &self.generations[generation]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn shift_ages_generations_and_leaves_front_empty() {
        let mut q = RetireQueue::new(2);
        q.retire(0, pid(10));
        q.retire(1, pid(11));
        q.shift();
        assert_eq!(q.generation(0), &[None, None]);
        assert_eq!(q.generation(1), &[Some(pid(10)), Some(pid(11))]);
        assert_eq!(q.depth(), MAX_MIGRATE_BACKLOG);
    }

    #[test]
    fn empty_slot_cannot_leave_a_stale_pid_in_generation_zero() {
        let mut q = RetireQueue::new(2);
        // Only slot 0 retires; slot 1 was empty at migrate time.
        q.retire(0, pid(10));
        q.shift();
        q.retire(0, pid(20));
        // Slot 1 of generation 0 must not have inherited anything.
        assert_eq!(q.generation(0), &[Some(pid(20)), None]);
        assert_eq!(q.occupied(), 2);
    }

    #[test]
    fn drain_generation_empties_exactly_one_cohort() {
        let mut q = RetireQueue::new(2);
        q.retire(0, pid(10));
        q.shift();
        q.retire(0, pid(20));
        let drained = q.drain_generation(1);
        assert_eq!(drained, vec![pid(10)]);
        assert_eq!(q.pids(), vec![pid(20)]);
    }

    #[test]
    fn clear_removes_one_occurrence_and_reports_misses() {
        let mut q = RetireQueue::new(1);
        q.retire(0, pid(10));
        assert!(q.clear(pid(10)));
        assert!(!q.clear(pid(10)));
        assert!(!q.clear(pid(999)));
        assert!(q.is_empty());
    }

    #[test]
    fn pids_lists_youngest_generation_first() {
        let mut q = RetireQueue::new(1);
        q.retire(0, pid(10));
        q.shift();
        q.retire(0, pid(20));
        assert_eq!(q.pids(), vec![pid(20), pid(10)]);
    }
}
