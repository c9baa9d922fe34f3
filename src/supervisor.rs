use anyhow::Context as _;
use chrono::Local;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Command;

use crate::backlog::{RetireQueue, MAX_MIGRATE_BACKLOG};
use crate::log::event;
use crate::stats::Stats;

/// Signal asking a retiring worker to finish in-flight work and exit on its
/// own schedule, as opposed to SIGTERM's "stop now".
pub const DRAIN_SIGNAL: Signal = Signal::SIGUSR2;

/// Seam between the supervision logic and the OS, so tests can drive the
/// supervisor with synthetic pids instead of forking real workers.
pub trait ProcessHost {
    fn spawn(&mut self, command: &str) -> anyhow::Result<Pid>;
    fn deliver(&mut self, pid: Pid, signal: Signal) -> anyhow::Result<()>;
    fn wall_clock_secs(&self) -> i64;
}

/// The real thing: workers run through a command shell so the configured
/// template can use redirections and arguments freely. The shell reports
/// launch failures as exit codes 126/127, which the reap path classifies.
pub struct ShellHost;

impl ProcessHost for ShellHost {
    fn spawn(&mut self, command: &str) -> anyhow::Result<Pid> {
        let child = Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .spawn()
            .with_context(|| format!("failed to spawn worker shell for {command:?}"))?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn deliver(&mut self, pid: Pid, signal: Signal) -> anyhow::Result<()> {
        kill(pid, signal).with_context(|| format!("deliver {signal} to pid {pid}"))?;
        Ok(())
    }

    fn wall_clock_secs(&self) -> i64 {
        Local::now().timestamp()
    }
}

/// How a reaped child exited.
#[derive(Debug, Clone, Copy)]
pub enum ExitKind {
    Exited(i32),
    Signaled(Signal),
}

/// What the reap classification decided for one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// An active worker died and was replaced in the same slot.
    ActiveRespawned { slot: usize, replacement: Pid },
    /// An active worker died and its slot was left empty (respawn disabled,
    /// or the shell reported a launch error).
    ActiveCleared { slot: usize },
    /// A retiring worker finished draining.
    RetireeReaped,
    /// Not ours to track; likely the tail end of a force-killed retiree.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// Second trigger within the same second: everything was terminated and
    /// the daemon should exit.
    ExitRequested,
}

/// Owns the active slot table, the retirement backlog, and the stats. All
/// mutation happens on the single control thread that also runs the reap
/// loop; nothing in here is shared.
pub struct Supervisor<H> {
    host: H,
    command: String,
    copies: usize,
    respawn: bool,
    fast_spawn_protect: bool,
    slots: Vec<Option<Pid>>,
    retiring: RetireQueue,
    stats: Stats,
    last_spawn_sec: Option<i64>,
    last_restart_sec: Option<i64>,
}

impl<H: ProcessHost> Supervisor<H> {
    pub fn new(
        host: H,
        command: String,
        copies: usize,
        respawn: bool,
        fast_spawn_protect: bool,
    ) -> Self {
        Supervisor {
            host,
            command,
            copies,
            respawn,
            fast_spawn_protect,
            slots: vec![None; copies],
            retiring: RetireQueue::new(copies),
            stats: Stats::new(),
            last_spawn_sec: None,
            last_restart_sec: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    pub fn respawn_enabled(&self) -> bool {
        self.respawn
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    pub fn active_pids(&self) -> Vec<Pid> {
        self.slots.iter().copied().flatten().collect()
    }

    pub fn retiring_pids(&self) -> Vec<Pid> {
        self.retiring.pids()
    }

    pub fn retiring(&self) -> &RetireQueue {
        &self.retiring
    }

    fn find_slot(&self, pid: Pid) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(pid))
    }

    /// Launch a worker into `slot`. With fast-spawn protection on, two
    /// spawns within the same wall-clock second are treated as a crash loop
    /// and abort the daemon rather than spinning.
    pub fn spawn_slot(&mut self, slot: usize) -> anyhow::Result<Pid> {
        let now = self.host.wall_clock_secs();
        if self.fast_spawn_protect && self.last_spawn_sec == Some(now) {
            anyhow::bail!("spawning too fast: two spawns within one second (crash loop?)");
        }
        self.last_spawn_sec = Some(now);

        let pid = self.host.spawn(&self.command)?;
        event("spawn", format!("slot={slot} pid={pid}"));
        self.slots[slot] = Some(pid);
        Ok(pid)
    }

    pub fn spawn_all(&mut self) -> anyhow::Result<()> {
        for slot in 0..self.copies {
            self.spawn_slot(slot)?;
        }
        Ok(())
    }

    /// Send SIGTERM and clear the slot either way; a failed delivery usually
    /// means the worker beat us to the exit.
    pub fn terminate_slot(&mut self, slot: usize) {
        let Some(pid) = self.slots[slot].take() else {
            return;
        };
        event("terminate", format!("slot={slot} pid={pid}"));
        if let Err(e) = self.host.deliver(pid, Signal::SIGTERM) {
            event("terminate", format!("slot={slot} pid={pid} delivery failed: {e:#}"));
        }
    }

    /// Full stop: every active slot, then every backlog generation.
    pub fn terminate_all(&mut self) {
        event("terminate", "all workers going down");
        for slot in 0..self.copies {
            self.terminate_slot(slot);
        }
        for generation in 0..MAX_MIGRATE_BACKLOG {
            self.force_terminate_generation(generation);
        }
    }

    fn force_terminate_generation(&mut self, generation: usize) {
        for pid in self.retiring.drain_generation(generation) {
            self.stats.note_retiree_killed();
            event(
                "terminate",
                format!("retiring pid={pid} generation={generation} force-killed"),
            );
            if let Err(e) = self.host.deliver(pid, Signal::SIGTERM) {
                event(
                    "terminate",
                    format!("retiring pid={pid} generation={generation} delivery failed: {e:#}"),
                );
            }
        }
    }

    /// Zero-downtime rollover: kill whatever is still draining in the oldest
    /// generation, age the backlog, then per slot spawn a replacement and
    /// move the previous worker into generation 0 with a drain signal.
    pub fn migrate_all(&mut self) -> anyhow::Result<()> {
        event("migrate", "migrating all workers");
        self.stats.note_migrate_request();

        self.force_terminate_generation(MAX_MIGRATE_BACKLOG - 1);
        self.retiring.shift();

        for slot in 0..self.copies {
            let previous = self.slots[slot];
            self.spawn_slot(slot)?;
            if let Some(old) = previous {
                self.stats.note_worker_retired();
                self.retiring.retire(slot, old);
                event("migrate", format!("slot={slot} old_pid={old} draining"));
                if let Err(e) = self.host.deliver(old, DRAIN_SIGNAL) {
                    event("migrate", format!("slot={slot} old_pid={old} drain delivery failed: {e:#}"));
                }
            }
        }

        event("migrate", "completed migrating all workers");
        Ok(())
    }

    /// Possible-downtime restart: terminate everything, spawn a fresh herd.
    /// A second trigger within the same wall-clock second means the operator
    /// wants out: terminate everything and report ExitRequested instead.
    pub fn restart_all(&mut self) -> anyhow::Result<RestartOutcome> {
        let now = self.host.wall_clock_secs();
        if self.last_restart_sec == Some(now) {
            event("restart", "second restart within one second: shutting down");
            self.terminate_all();
            return Ok(RestartOutcome::ExitRequested);
        }
        self.last_restart_sec = Some(now);

        event("restart", "restarting (not migrating) all workers");
        self.stats.note_restart_request(self.copies);
        self.terminate_all();
        self.spawn_all()?;
        Ok(RestartOutcome::Restarted)
    }

    /// Classify one reaped pid. Exit codes 126/127 come from the launch
    /// shell itself, so respawning would only crash-loop; they pin the slot
    /// empty even when respawn is otherwise enabled.
    pub fn handle_exit(&mut self, pid: Pid, kind: ExitKind) -> anyhow::Result<Reaped> {
        let mut respawn = self.respawn;
        match kind {
            ExitKind::Exited(code @ (126 | 127)) => {
                event("reap", format!("pid={pid} shell launch error status={code}"));
                respawn = false;
            }
            ExitKind::Exited(code) => {
                event("reap", format!("pid={pid} exited status={code}"));
            }
            ExitKind::Signaled(sig) => {
                event("reap", format!("pid={pid} killed by signal={sig}"));
            }
        }

        if let Some(slot) = self.find_slot(pid) {
            self.stats.note_unexpected_exit();
            if respawn {
                let replacement = self.spawn_slot(slot)?;
                event("reap", format!("slot={slot} pid={pid} respawned as {replacement}"));
                return Ok(Reaped::ActiveRespawned { slot, replacement });
            }
            self.slots[slot] = None;
            event("reap", format!("slot={slot} pid={pid} not respawned"));
            return Ok(Reaped::ActiveCleared { slot });
        }

        if self.retiring.clear(pid) {
            self.stats.note_retiree_reaped();
            event("reap", format!("retiring pid={pid} finished draining"));
            return Ok(Reaped::RetireeReaped);
        }

        // Not tracked anywhere; likely already force-killed out of the
        // backlog before the exit was reported.
        Ok(Reaped::Unknown)
    }
}
