use chrono::{DateTime, Local};

/// Counters and timestamps updated by every state-changing operation and
/// read by the state-snapshot action. All counters are monotone except the
/// `retiring_workers` gauge, which tracks current backlog occupancy.
#[derive(Debug, Clone)]
pub struct Stats {
    pub restart_requests: u64,
    pub migrate_requests: u64,
    pub state_dump_requests: u64,
    pub expected_worker_restarts: u64,
    pub unexpected_worker_restarts: u64,
    pub migrated_workers: u64,
    pub retiring_workers: u64,

    pub started_at: DateTime<Local>,
    pub last_restart_request: Option<DateTime<Local>>,
    pub last_migrate_request: Option<DateTime<Local>>,
    pub last_expected_restart: Option<DateTime<Local>>,
    pub last_unexpected_restart: Option<DateTime<Local>>,
    pub last_retiree_exit: Option<DateTime<Local>>,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            restart_requests: 0,
            migrate_requests: 0,
            state_dump_requests: 0,
            expected_worker_restarts: 0,
            unexpected_worker_restarts: 0,
            migrated_workers: 0,
            retiring_workers: 0,
            started_at: Local::now(),
            last_restart_request: None,
            last_migrate_request: None,
            last_expected_restart: None,
            last_unexpected_restart: None,
            last_retiree_exit: None,
        }
    }

    pub fn note_migrate_request(&mut self) {
        self.migrate_requests += 1;
        self.last_migrate_request = Some(Local::now());
    }

    /// A full restart retires every copy on purpose.
    pub fn note_restart_request(&mut self, copies: usize) {
        self.restart_requests += 1;
        self.expected_worker_restarts += copies as u64;
        let now = Local::now();
        self.last_restart_request = Some(now);
        self.last_expected_restart = Some(now);
    }

    pub fn note_state_dump(&mut self) {
        self.state_dump_requests += 1;
    }

    pub fn note_unexpected_exit(&mut self) {
        self.unexpected_worker_restarts += 1;
        self.last_unexpected_restart = Some(Local::now());
    }

    /// A worker moved from its active slot into backlog generation 0.
    pub fn note_worker_retired(&mut self) {
        self.migrated_workers += 1;
        self.retiring_workers += 1;
    }

    /// A retiring worker drained and exited on its own.
    pub fn note_retiree_reaped(&mut self) {
        self.retiring_workers = self.retiring_workers.saturating_sub(1);
        self.last_retiree_exit = Some(Local::now());
    }

    /// A retiring worker was force-terminated before it finished draining.
    pub fn note_retiree_killed(&mut self) {
        self.retiring_workers = self.retiring_workers.saturating_sub(1);
    }

    /// Retired workers that have finished draining (exited or were killed).
    pub fn migrations_completed(&self) -> u64 {
        self.migrated_workers.saturating_sub(self.retiring_workers)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_time(t: &DateTime<Local>) -> String {
    t.format("%Y-%m-%d_%H:%M:%S").to_string()
}

pub fn format_opt_time(t: &Option<DateTime<Local>>) -> Option<String> {
    t.as_ref().map(format_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_backlog_occupancy() {
        let mut s = Stats::new();
        s.note_worker_retired();
        s.note_worker_retired();
        assert_eq!(s.retiring_workers, 2);
        assert_eq!(s.migrated_workers, 2);
        s.note_retiree_reaped();
        assert_eq!(s.retiring_workers, 1);
        s.note_retiree_killed();
        assert_eq!(s.retiring_workers, 0);
        // Monotone counters never go back down.
        assert_eq!(s.migrated_workers, 2);
        assert_eq!(s.migrations_completed(), 2);
    }

    #[test]
    fn restart_request_counts_every_copy_as_expected() {
        let mut s = Stats::new();
        s.note_restart_request(3);
        assert_eq!(s.restart_requests, 1);
        assert_eq!(s.expected_worker_restarts, 3);
        assert!(s.last_restart_request.is_some());
        assert!(s.last_expected_restart.is_some());
    }
}
