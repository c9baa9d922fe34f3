use anyhow::Context as _;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::stats::{format_opt_time, format_time, Stats};

/// Where state snapshots land; the file name is keyed by the daemon's pid and
/// the requesting pid so concurrent callers never clobber each other.
pub const STATE_DIR: &str = "/tmp";

/// Point-in-time view of the daemon, written on demand for an external
/// caller. Field set mirrors what operators need to see: identity, policy,
/// topology, and the cumulative migration/restart statistics.
#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub pid: i32,
    pub start_time: String,
    pub mode: String,
    pub respawn: bool,
    pub config: String,
    pub log: String,
    pub copies: usize,
    pub command: String,
    pub environment: String,
    pub sockets: SocketsSection,
    pub workers: WorkersSection,
    pub migrations: MigrationsSection,
    pub restarts: RestartsSection,
}

#[derive(Debug, Serialize)]
pub struct SocketsSection {
    pub count: usize,
    pub details: Vec<SocketDetail>,
}

#[derive(Debug, Serialize)]
pub struct SocketDetail {
    pub name: String,
    pub ipver: u8,
    pub addr: String,
    pub port: u16,
    pub backlog: i32,
}

#[derive(Debug, Serialize)]
pub struct WorkersSection {
    pub count: usize,
    pub pids: Vec<i32>,
    pub backlog_count: u64,
    pub backlog_pids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct MigrationsSection {
    pub requests: u64,
    pub last_request_time: Option<String>,
    pub workers_requested: u64,
    pub workers_completed: u64,
    pub workers_uncompleted: u64,
    pub last_worker_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RestartsSection {
    pub requests: u64,
    pub last_request_time: Option<String>,
    pub workers_expected: u64,
    pub last_expected_time: Option<String>,
    pub workers_unexpected: u64,
    pub last_unexpected_time: Option<String>,
}

pub struct SnapshotInputs<'a> {
    pub daemon_pid: i32,
    pub debug_mode: bool,
    pub respawn: bool,
    pub config_path: &'a Path,
    pub log_path: &'a Path,
    pub command: &'a str,
    pub cfg: &'a Config,
    pub active_pids: Vec<i32>,
    pub backlog_pids: Vec<i32>,
    pub stats: &'a Stats,
}

pub fn collect(inputs: &SnapshotInputs<'_>) -> StateSnapshot {
    let stats = inputs.stats;
    StateSnapshot {
        pid: inputs.daemon_pid,
        start_time: format_time(&stats.started_at),
        mode: if inputs.debug_mode { "debug" } else { "production" }.to_string(),
        respawn: inputs.respawn,
        config: inputs.config_path.display().to_string(),
        log: inputs.log_path.display().to_string(),
        copies: inputs.cfg.copies,
        command: inputs.command.to_string(),
        environment: inputs.cfg.environment.clone().unwrap_or_default(),
        sockets: SocketsSection {
            count: inputs.cfg.sockets.len(),
            details: inputs
                .cfg
                .sockets
                .iter()
                .map(|s| SocketDetail {
                    name: s.name.clone(),
                    ipver: s.ip_version.as_number(),
                    addr: s.address.to_string(),
                    port: s.port,
                    backlog: s.backlog,
                })
                .collect(),
        },
        workers: WorkersSection {
            count: inputs.cfg.copies,
            pids: inputs.active_pids.clone(),
            backlog_count: stats.retiring_workers,
            backlog_pids: inputs.backlog_pids.clone(),
        },
        migrations: MigrationsSection {
            requests: stats.migrate_requests,
            last_request_time: format_opt_time(&stats.last_migrate_request),
            workers_requested: stats.migrated_workers,
            workers_completed: stats.migrations_completed(),
            workers_uncompleted: stats.retiring_workers,
            last_worker_time: format_opt_time(&stats.last_retiree_exit),
        },
        restarts: RestartsSection {
            requests: stats.restart_requests,
            last_request_time: format_opt_time(&stats.last_restart_request),
            workers_expected: stats.expected_worker_restarts,
            last_expected_time: format_opt_time(&stats.last_expected_restart),
            workers_unexpected: stats.unexpected_worker_restarts,
            last_unexpected_time: format_opt_time(&stats.last_unexpected_restart),
        },
    }
}

/// Write the snapshot as pretty JSON to
/// `<dir>/droverd-<daemon_pid>-<caller_pid>.state` and return the path.
pub fn write(dir: &Path, snapshot: &StateSnapshot, caller_pid: i32) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("droverd-{}-{}.state", snapshot.pid, caller_pid));
    let json = serde_json::to_string_pretty(snapshot).context("serialize state snapshot")?;
    std::fs::write(&path, json)
        .with_context(|| format!("write state snapshot {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::stats::Stats;

    fn sample_config() -> Config {
        config::parse(
            "command: node server.js\n\
             socket: http 4 127.0.0.1 8080 128\n\
             environment: staging\n\
             copies: 2\n",
        )
        .unwrap()
    }

    #[test]
    fn snapshot_carries_identity_topology_and_stats() {
        let cfg = sample_config();
        let mut stats = Stats::new();
        stats.note_migrate_request();
        stats.note_worker_retired();

        let snap = collect(&SnapshotInputs {
            daemon_pid: 4242,
            debug_mode: true,
            respawn: true,
            config_path: Path::new("/etc/droverd.conf"),
            log_path: Path::new("droverd.log"),
            command: "node server.js --fd http,socket,5",
            cfg: &cfg,
            active_pids: vec![101, 102],
            backlog_pids: vec![90],
            stats: &stats,
        });

        assert_eq!(snap.pid, 4242);
        assert_eq!(snap.mode, "debug");
        assert_eq!(snap.copies, 2);
        assert_eq!(snap.environment, "staging");
        assert_eq!(snap.sockets.count, 1);
        assert_eq!(snap.sockets.details[0].name, "http");
        assert_eq!(snap.sockets.details[0].ipver, 4);
        assert_eq!(snap.workers.pids, vec![101, 102]);
        assert_eq!(snap.workers.backlog_pids, vec![90]);
        assert_eq!(snap.workers.backlog_count, 1);
        assert_eq!(snap.migrations.requests, 1);
        assert_eq!(snap.migrations.workers_requested, 1);
        assert_eq!(snap.migrations.workers_uncompleted, 1);
        assert_eq!(snap.migrations.workers_completed, 0);
    }

    #[test]
    fn write_keys_the_file_by_daemon_and_caller_pid() {
        let cfg = sample_config();
        let stats = Stats::new();
        let snap = collect(&SnapshotInputs {
            daemon_pid: 7,
            debug_mode: false,
            respawn: false,
            config_path: Path::new("a.conf"),
            log_path: Path::new("a.log"),
            command: "run",
            cfg: &cfg,
            active_pids: vec![],
            backlog_pids: vec![],
            stats: &stats,
        });

        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), &snap, 99).unwrap();
        assert!(path.ends_with("droverd-7-99.state"));
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["mode"], "production");
        assert_eq!(parsed["workers"]["count"], 2);
        assert_eq!(parsed["restarts"]["requests"], 0);
    }
}
