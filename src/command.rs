use std::fmt::Write as _;
use std::os::unix::io::AsRawFd as _;

use crate::config::AppOption;
use crate::provision::ProvisionedFd;

/// The built command string is composed once at startup and reused for every
/// generation, so an oversized line is a configuration error, not a spawn
/// error.
pub const MAX_COMMAND_LINE: usize = 1024;

/// Append the worker invocation contract to the command template:
/// ` --fd name,socket,<fd>` per socket, ` --file key,<fd>` per file,
/// ` --<optionname> <value>` per app option, ` --env <tag>` if set.
pub fn build_command(
    template: &str,
    descriptors: &[ProvisionedFd],
    app_options: &[AppOption],
    environment: Option<&str>,
) -> anyhow::Result<String> {
    let mut cmd = String::from(template);

    for d in descriptors {
        if let ProvisionedFd::Socket { name, fd, .. } = d {
            let _ = write!(cmd, " --fd {},socket,{}", name, fd.as_raw_fd());
        }
    }
    for d in descriptors {
        if let ProvisionedFd::File { key, fd, .. } = d {
            let _ = write!(cmd, " --file {},{}", key, fd.as_raw_fd());
        }
    }
    for opt in app_options {
        let _ = write!(cmd, " --{} {}", opt.name, opt.value);
    }
    if let Some(tag) = environment {
        let _ = write!(cmd, " --env {tag}");
    }

    anyhow::ensure!(
        cmd.len() <= MAX_COMMAND_LINE,
        "worker command line too long ({} bytes, limit {MAX_COMMAND_LINE}): {cmd:?}",
        cmd.len()
    );
    Ok(cmd)
}
