use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpid, Pid};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::cli::Args;
use crate::command;
use crate::config::{self, Config};
use crate::log::event;
use crate::provision::{self, ProvisionedFd};
use crate::snapshot::{self, SnapshotInputs};
use crate::startup;
use crate::supervisor::{ExitKind, RestartOutcome, ShellHost, Supervisor};

/// Why the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGTERM: exit with failure status so "asked to die" is
    /// distinguishable from a clean stop.
    Terminated,
    /// Debounced interactive restart: the operator wants out; exit cleanly.
    OperatorExit,
}

// Control-plane deliveries are recorded here by the signal handlers and
// drained by the single control thread. Handlers touch nothing else: all
// real state lives in the Supervisor, which only the control thread mutates.
static DAEMON_PID: AtomicI32 = AtomicI32::new(0);
static PENDING_MIGRATE: AtomicBool = AtomicBool::new(false);
static PENDING_RESTART: AtomicBool = AtomicBool::new(false);
static PENDING_TERMINATE: AtomicBool = AtomicBool::new(false);
static PENDING_DUMP: AtomicBool = AtomicBool::new(false);
static DUMP_CALLER: AtomicI32 = AtomicI32::new(0);

/// A forked child that has not exec'd yet inherits these handlers; a
/// delivery landing there must be ignored, so every handler checks that it
/// is running in the supervisor process itself.
fn in_daemon_process() -> bool {
    unsafe { libc::getpid() == DAEMON_PID.load(Ordering::SeqCst) }
}

extern "C" fn on_migrate_signal(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if !in_daemon_process() {
        return;
    }
    PENDING_MIGRATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_restart_signal(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if !in_daemon_process() {
        return;
    }
    PENDING_RESTART.store(true, Ordering::SeqCst);
}

extern "C" fn on_terminate_signal(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if !in_daemon_process() {
        return;
    }
    PENDING_TERMINATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_dump_signal(_: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if !in_daemon_process() {
        return;
    }
    let caller = if info.is_null() { 0 } else { unsafe { (*info).si_pid() } };
    DUMP_CALLER.store(caller, Ordering::SeqCst);
    PENDING_DUMP.store(true, Ordering::SeqCst);
}

fn take_flag(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

/// Handlers only set pending flags. SA_RESTART is deliberately absent: a
/// delivery must interrupt the blocking waitpid with EINTR so the control
/// loop drains the flags before waiting again.
fn install_signal_handlers(daemon_pid: Pid, debug_mode: bool) -> anyhow::Result<()> {
    DAEMON_PID.store(daemon_pid.as_raw(), Ordering::SeqCst);

    type Handler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);
    fn install(sig: Signal, handler: Handler) -> anyhow::Result<()> {
        let action = SigAction::new(
            SigHandler::SigAction(handler),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        unsafe { sigaction(sig, &action) }.with_context(|| format!("install {sig} handler"))?;
        Ok(())
    }

    install(Signal::SIGUSR1, on_migrate_signal)?;
    install(Signal::SIGTERM, on_terminate_signal)?;
    install(Signal::SIGUSR2, on_dump_signal)?;
    if debug_mode {
        install(Signal::SIGINT, on_restart_signal)?;
    }
    Ok(())
}

struct Daemon {
    cfg: Config,
    debug_mode: bool,
    config_path: PathBuf,
    log_path: PathBuf,
    daemon_pid: Pid,
    /// Held for the daemon's lifetime so the inherited descriptor numbers
    /// stay valid for every future worker generation.
    #[allow(dead_code)]
    provisioned: Vec<ProvisionedFd>,
    sup: Supervisor<ShellHost>,
}

pub fn run(args: Args) -> anyhow::Result<Shutdown> {
    let cfg = config::load(&args.config)?;
    let log_path = args.log_path();

    if !args.debug {
        startup::daemonize(&log_path)?;
    }
    let daemon_pid = getpid();

    let build_time = option_env!("DROVERD_BUILD_TIME").unwrap_or("unknown");
    let build_host = option_env!("DROVERD_BUILD_HOST").unwrap_or("unknown");
    event(
        "boot",
        format!("droverd started pid={daemon_pid} build_time={build_time} build_host={build_host}"),
    );

    install_signal_handlers(daemon_pid, args.debug)?;
    startup::change_to_config_dir(&args.config)?;

    let provisioned = provision::provision(&cfg)?;
    let worker_command = command::build_command(
        &cfg.command,
        &provisioned,
        &cfg.app_options,
        cfg.environment.as_deref(),
    )?;
    event("boot", format!("worker command: {worker_command:?}"));

    startup::drop_privileges();

    let mut sup = Supervisor::new(
        ShellHost,
        worker_command,
        cfg.copies,
        !args.no_respawn,
        args.fast_spawn_protect,
    );
    sup.spawn_all()?;

    let mut daemon = Daemon {
        cfg,
        debug_mode: args.debug,
        config_path: args.config,
        log_path,
        daemon_pid,
        provisioned,
        sup,
    };
    daemon.control_loop()
}

impl Daemon {
    /// The single control thread: blocks waiting for any child to exit, and
    /// drains pending control-plane actions whenever a signal interrupts the
    /// wait. Each action runs to completion before the next reap or action
    /// is handled, so a migration can never interleave with a reap.
    fn control_loop(&mut self) -> anyhow::Result<Shutdown> {
        loop {
            if let Some(shutdown) = self.drain_pending_actions()? {
                return Ok(shutdown);
            }

            match waitpid(None, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    // ECHILD lands here once respawn is disabled and the
                    // whole herd has died off.
                    event("reap", format!("error waiting for worker exit: {e}"));
                    anyhow::bail!("error waiting for worker exit: {e}");
                }
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.sup.handle_exit(pid, ExitKind::Exited(code))?;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.sup.handle_exit(pid, ExitKind::Signaled(sig))?;
                }
                Ok(other) => {
                    anyhow::bail!("unexpected wait status: {other:?}");
                }
            }
        }
    }

    fn drain_pending_actions(&mut self) -> anyhow::Result<Option<Shutdown>> {
        if take_flag(&PENDING_TERMINATE) {
            event("signal", "SIGTERM: terminate all workers & exit");
            self.sup.terminate_all();
            return Ok(Some(Shutdown::Terminated));
        }
        if take_flag(&PENDING_MIGRATE) {
            event("signal", "SIGUSR1: migrating all workers");
            self.sup.migrate_all()?;
        }
        if take_flag(&PENDING_RESTART) {
            event("signal", "SIGINT: restarting (not migrating) all workers");
            if self.sup.restart_all()? == RestartOutcome::ExitRequested {
                return Ok(Some(Shutdown::OperatorExit));
            }
        }
        if take_flag(&PENDING_DUMP) {
            let caller = DUMP_CALLER.swap(0, Ordering::SeqCst);
            event("signal", format!("SIGUSR2: state snapshot requested by pid={caller}"));
            self.dump_state(caller);
        }
        Ok(None)
    }

    /// Write the snapshot and signal the caller back as a completion
    /// handshake. Failures here are logged, never fatal: state dumping is an
    /// observability path, not part of supervision.
    fn dump_state(&mut self, caller: i32) {
        self.sup.stats_mut().note_state_dump();

        let active_pids: Vec<i32> = self.sup.active_pids().into_iter().map(|p| p.as_raw()).collect();
        let backlog_pids: Vec<i32> = self.sup.retiring_pids().into_iter().map(|p| p.as_raw()).collect();
        let snap = snapshot::collect(&SnapshotInputs {
            daemon_pid: self.daemon_pid.as_raw(),
            debug_mode: self.debug_mode,
            respawn: self.sup.respawn_enabled(),
            config_path: &self.config_path,
            log_path: &self.log_path,
            command: self.sup.command(),
            cfg: &self.cfg,
            active_pids,
            backlog_pids,
            stats: self.sup.stats(),
        });

        match snapshot::write(Path::new(snapshot::STATE_DIR), &snap, caller) {
            Ok(path) => event("state", format!("snapshot written to {}", path.display())),
            Err(e) => {
                event("state", format!("snapshot failed: {e:#}"));
                return;
            }
        }

        if caller > 0 {
            if let Err(e) = kill(Pid::from_raw(caller), Signal::SIGUSR2) {
                event("state", format!("couldn't notify caller pid={caller}: {e}"));
            }
        }
    }
}
