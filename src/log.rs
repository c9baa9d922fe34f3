use chrono::Local;

/// Timestamped, component-tagged event line on stderr. In daemon mode stderr
/// is redirected to the log file by startup, so this is the daemon's log
/// stream; in debug mode it goes straight to the terminal.
pub fn event(component: &str, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    eprintln!("{ts} [{component}] {}", msg.as_ref());
}
