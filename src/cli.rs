use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "droverd", version, about = "keeps N copies of a worker command alive")]
pub struct Args {
    /// Stay in the foreground and enable the interactive restart trigger (SIGINT)
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Do not respawn workers that exit
    #[arg(short = 'n', long = "no-respawn")]
    pub no_respawn: bool,

    /// Treat two spawns within the same wall-clock second as a crash loop and abort
    #[arg(short = 'F', long = "fast-spawn-protect")]
    pub fast_spawn_protect: bool,

    /// Path to the worker config file
    pub config: PathBuf,

    /// Log file (daemon mode redirects stdout/stderr here)
    pub logfile: Option<PathBuf>,
}

impl Args {
    /// Effective log path; `droverd.log` next to the starting directory unless given.
    pub fn log_path(&self) -> PathBuf {
        self.logfile
            .clone()
            .unwrap_or_else(|| PathBuf::from("droverd.log"))
    }
}
