use std::io::Write as _;
use std::path::Path;

use droverd::config;

#[test]
fn loads_config_from_disk() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        "# the herd\n\
         command: node app.js\n\
         socket: web 4 0.0.0.0 9000 64\n\
         file: cert certs/server.pem\n\
         copies: 3\n"
    )
    .unwrap();

    let cfg = config::load(f.path()).unwrap();
    assert_eq!(cfg.command, "node app.js");
    assert_eq!(cfg.copies, 3);
    assert_eq!(cfg.sockets.len(), 1);
    assert_eq!(cfg.sockets[0].name, "web");
    assert_eq!(cfg.files[0].path, Path::new("certs/server.pem"));
}

#[test]
fn unreadable_config_is_fatal() {
    let err = config::load(Path::new("/nonexistent/droverd.conf")).unwrap_err();
    assert!(format!("{err:#}").contains("failed to read config"));
}

#[test]
fn config_errors_name_the_offending_line() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(f, "command: run\nsocket: broken\n").unwrap();
    let err = config::load(f.path()).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));
}
