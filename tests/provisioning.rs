use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{getsockname, SockaddrIn};
use std::io::Write as _;
use std::net::TcpStream;

use droverd::command::build_command;
use droverd::config;
use droverd::provision;

#[test]
fn provisions_sockets_and_files_and_builds_the_worker_command() {
    let mut cert = tempfile::NamedTempFile::new().unwrap();
    writeln!(cert, "not really a certificate").unwrap();

    // Port 0 lets the OS pick a free port so the test never collides.
    let cfg = config::parse(&format!(
        "command: sleep 60\n\
         socket: http 4 127.0.0.1 0 16\n\
         file: cert {}\n\
         app-verbose: 1\n\
         environment: test\n",
        cert.path().display()
    ))
    .unwrap();

    let table = provision::provision(&cfg).unwrap();
    assert_eq!(table.len(), 2);
    let sock_fd = table[0].raw_fd();
    let file_fd = table[1].raw_fd();

    // The listener is live before any worker exists: connecting succeeds.
    let addr = getsockname::<SockaddrIn>(sock_fd).unwrap();
    let port = addr.port();
    assert_ne!(port, 0);
    TcpStream::connect(("127.0.0.1", port)).unwrap();

    // Workers must be able to inherit the descriptors across exec, and the
    // listener must be non-blocking.
    for fd in [sock_fd, file_fd] {
        let fd_flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        assert!(!fd_flags.contains(FdFlag::FD_CLOEXEC), "fd {fd} has CLOEXEC set");
    }
    let status_flags = OFlag::from_bits_truncate(fcntl(sock_fd, FcntlArg::F_GETFL).unwrap());
    assert!(status_flags.contains(OFlag::O_NONBLOCK));

    // The built command advertises the actual inherited descriptor numbers,
    // sockets before files, app options and the environment tag last.
    let cmd = build_command(
        &cfg.command,
        &table,
        &cfg.app_options,
        cfg.environment.as_deref(),
    )
    .unwrap();
    assert!(cmd.starts_with("sleep 60"));
    assert!(cmd.contains(&format!(" --fd http,socket,{sock_fd}")));
    assert!(cmd.contains(&format!(" --file cert,{file_fd}")));
    assert!(cmd.ends_with(" --app-verbose 1 --env test"));
    assert!(cmd.find("--fd").unwrap() < cmd.find("--file").unwrap());
}

#[test]
fn missing_worker_file_is_fatal() {
    let cfg = config::parse("command: run\nfile: cert /nonexistent/cert.pem\n").unwrap();
    let err = provision::provision(&cfg).unwrap_err();
    assert!(format!("{err:#}").contains("cert"));
}
