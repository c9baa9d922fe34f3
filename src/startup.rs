use anyhow::Context as _;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Detach from the terminal: fork (parent exits), point stdin at /dev/null
/// and stdout/stderr at the log file, then become session leader. Everything
/// the daemon prints from here on lands in the log file.
pub fn daemonize(log_path: &Path) -> anyhow::Result<()> {
    match unsafe { fork() }.context("fork for daemonize")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = File::open("/dev/null").context("open /dev/null")?;
    dup2(devnull.as_raw_fd(), libc::STDIN_FILENO).context("redirect stdin")?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;
    dup2(log.as_raw_fd(), libc::STDOUT_FILENO).context("redirect stdout")?;
    dup2(log.as_raw_fd(), libc::STDERR_FILENO).context("redirect stderr")?;

    umask(Mode::from_bits_truncate(0o027));
    setsid().context("become session leader")?;
    Ok(())
}

/// Relative paths in the config (worker files, the command itself) resolve
/// against the config file's directory.
pub fn change_to_config_dir(config_path: &Path) -> anyhow::Result<()> {
    let dir = match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    chdir(dir).with_context(|| format!("change directory to {}", dir.display()))?;
    Ok(())
}

/// Hook for deployments that start droverd as root and want workers running
/// as an unprivileged user. Intentionally a no-op: privilege policy belongs
/// to the wrapper that launches the daemon, not to the supervision core.
pub fn drop_privileges() {}
