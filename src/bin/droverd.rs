use clap::Parser;

use droverd::daemon::{self, Shutdown};

fn main() {
    let args = droverd::cli::Args::parse();
    match daemon::run(args) {
        // Debounced interactive restart: the operator asked us to stop.
        Ok(Shutdown::OperatorExit) => {}
        // Shutdown via external signal is always reported as abnormal so that
        // init systems can tell "asked to die" apart from a clean stop.
        Ok(Shutdown::Terminated) => std::process::exit(1),
        Err(e) => {
            eprintln!("droverd: {e:#}");
            std::process::exit(1);
        }
    }
}
