use anyhow::Context as _;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol,
    SockType, SockaddrIn, SockaddrIn6,
};
use nix::unistd::dup;
use std::fs::File;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::config::{Config, FileSpec, IpVersion, SocketSpec};
use crate::log::event;

/// A descriptor opened once at startup and inherited by every worker
/// generation. The owned fd is held for the daemon's lifetime and carries no
/// CLOEXEC flag, so it survives the exec into the worker shell.
#[derive(Debug)]
pub enum ProvisionedFd {
    Socket {
        name: String,
        ip_version: IpVersion,
        address: IpAddr,
        port: u16,
        backlog: i32,
        fd: OwnedFd,
    },
    File {
        key: String,
        path: PathBuf,
        fd: OwnedFd,
    },
}

impl ProvisionedFd {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            ProvisionedFd::Socket { fd, .. } | ProvisionedFd::File { fd, .. } => fd.as_raw_fd(),
        }
    }
}

/// Open everything the workers depend on, sockets first. Any failure is
/// fatal: workers must see the complete descriptor table before the first
/// spawn, so there is no partial-success mode.
pub fn provision(cfg: &Config) -> anyhow::Result<Vec<ProvisionedFd>> {
    let mut out = provision_sockets(&cfg.sockets)?;
    out.extend(provision_files(&cfg.files)?);
    Ok(out)
}

pub fn provision_sockets(specs: &[SocketSpec]) -> anyhow::Result<Vec<ProvisionedFd>> {
    specs.iter().map(open_listener).collect()
}

fn open_listener(spec: &SocketSpec) -> anyhow::Result<ProvisionedFd> {
    let family = match spec.ip_version {
        IpVersion::V4 => AddressFamily::Inet,
        IpVersion::V6 => AddressFamily::Inet6,
    };

    // No SOCK_CLOEXEC: the whole point is for workers to inherit this fd.
    let fd = socket(family, SockType::Stream, SockFlag::empty(), SockProtocol::Tcp)
        .with_context(|| format!("socket {}: create", spec.name))?;

    setsockopt(&fd, sockopt::ReuseAddr, &true)
        .with_context(|| format!("socket {}: set SO_REUSEADDR", spec.name))?;

    // Workers expect a non-blocking listener.
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .with_context(|| format!("socket {}: set O_NONBLOCK", spec.name))?;

    match (spec.ip_version, spec.address) {
        (IpVersion::V4, IpAddr::V4(ip)) => {
            let addr = SockaddrIn::from(SocketAddrV4::new(ip, spec.port));
            bind(fd.as_raw_fd(), &addr)
                .with_context(|| format!("socket {}: bind {}:{}", spec.name, ip, spec.port))?;
        }
        (IpVersion::V6, IpAddr::V6(ip)) => {
            let addr = SockaddrIn6::from(SocketAddrV6::new(ip, spec.port, 0, 0));
            bind(fd.as_raw_fd(), &addr)
                .with_context(|| format!("socket {}: bind [{}]:{}", spec.name, ip, spec.port))?;
        }
        // Config validation rejects mismatched families before we get here.
        _ => anyhow::bail!("socket {}: address family mismatch", spec.name),
    }

    let backlog = Backlog::new(spec.backlog)
        .with_context(|| format!("socket {}: backlog {}", spec.name, spec.backlog))?;
    listen(&fd, backlog).with_context(|| format!("socket {}: listen", spec.name))?;

    event(
        "provision",
        format!(
            "socket name={} fd={} addr={}:{} backlog={}",
            spec.name,
            fd.as_raw_fd(),
            spec.address,
            spec.port,
            spec.backlog
        ),
    );

    Ok(ProvisionedFd::Socket {
        name: spec.name.clone(),
        ip_version: spec.ip_version,
        address: spec.address,
        port: spec.port,
        backlog: spec.backlog,
        fd,
    })
}

pub fn provision_files(specs: &[FileSpec]) -> anyhow::Result<Vec<ProvisionedFd>> {
    specs.iter().map(open_file).collect()
}

fn open_file(spec: &FileSpec) -> anyhow::Result<ProvisionedFd> {
    let f = File::open(&spec.path)
        .with_context(|| format!("file {}: open {}", spec.key, spec.path.display()))?;
    // std sets CLOEXEC on open; dup the descriptor to clear it so workers
    // inherit the file.
    let raw = dup(f.as_raw_fd()).with_context(|| format!("file {}: dup", spec.key))?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    event(
        "provision",
        format!("file key={} fd={} path={}", spec.key, fd.as_raw_fd(), spec.path.display()),
    );

    Ok(ProvisionedFd::File {
        key: spec.key.clone(),
        path: spec.path.clone(),
        fd,
    })
}
