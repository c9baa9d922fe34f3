use anyhow::Context as _;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::log::event;

/// Maximum number of worker copies. One per core is usually plenty.
pub const MAX_COPIES: usize = 10;
pub const MAX_SOCKETS: usize = 10;
pub const MAX_FILES: usize = 10;
pub const MAX_APP_OPTIONS: usize = 10;

/// Read-once worker configuration; immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base command template every worker generation executes.
    pub command: String,
    pub sockets: Vec<SocketSpec>,
    pub files: Vec<FileSpec>,
    /// Extra `--name value` options appended verbatim; names keep their
    /// `app-` prefix from the config key.
    pub app_options: Vec<AppOption>,
    pub environment: Option<String>,
    pub copies: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn as_number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_number())
    }
}

#[derive(Debug, Clone)]
pub struct SocketSpec {
    pub name: String,
    pub ip_version: IpVersion,
    pub address: IpAddr,
    pub port: u16,
    pub backlog: i32,
}

#[derive(Debug, Clone)]
pub struct FileSpec {
    pub key: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppOption {
    pub name: String,
    pub value: String,
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Parse the line-oriented `key: value` config format. `#` starts a comment
/// line; unknown keys are fatal.
pub fn parse(raw: &str) -> anyhow::Result<Config> {
    let mut command: Option<String> = None;
    let mut sockets: Vec<SocketSpec> = Vec::new();
    let mut files: Vec<FileSpec> = Vec::new();
    let mut app_options: Vec<AppOption> = Vec::new();
    let mut environment: Option<String> = None;
    let mut copies: usize = 1;

    for (idx, line) in raw.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("line {lineno}: expected 'key: value'"))?;
        let value = value.trim();

        match key {
            "command" => {
                anyhow::ensure!(command.is_none(), "line {lineno}: command already set");
                command = Some(value.to_string());
            }
            "socket" => {
                anyhow::ensure!(
                    sockets.len() < MAX_SOCKETS,
                    "line {lineno}: too many sockets defined (maximum {MAX_SOCKETS})"
                );
                let spec = parse_socket_spec(value)
                    .with_context(|| format!("line {lineno}: invalid socket spec"))?;
                anyhow::ensure!(
                    !sockets.iter().any(|s| s.name == spec.name),
                    "line {lineno}: duplicate socket name {:?}",
                    spec.name
                );
                sockets.push(spec);
            }
            "file" => {
                anyhow::ensure!(
                    files.len() < MAX_FILES,
                    "line {lineno}: too many files defined (maximum {MAX_FILES})"
                );
                let spec = parse_file_spec(value)
                    .with_context(|| format!("line {lineno}: invalid file spec"))?;
                anyhow::ensure!(
                    !files.iter().any(|f| f.key == spec.key),
                    "line {lineno}: duplicate file key {:?}",
                    spec.key
                );
                files.push(spec);
            }
            "environment" => {
                anyhow::ensure!(environment.is_none(), "line {lineno}: environment already set");
                anyhow::ensure!(!value.is_empty(), "line {lineno}: environment must not be empty");
                environment = Some(value.to_string());
            }
            "copies" => {
                copies = match value.parse::<i64>() {
                    Ok(c) if c <= 0 => {
                        event("config", format!("invalid copies value {value:?}, defaulting to 1"));
                        1
                    }
                    Ok(c) if c as usize > MAX_COPIES => {
                        event(
                            "config",
                            format!("copies {c} exceeds maximum of {MAX_COPIES}, clamping"),
                        );
                        MAX_COPIES
                    }
                    Ok(c) => c as usize,
                    Err(_) => {
                        event("config", format!("invalid copies value {value:?}, defaulting to 1"));
                        1
                    }
                };
            }
            "user" => {
                // Privilege dropping is an external hook; see startup::drop_privileges.
                event("config", format!("user directive {value:?} is not implemented"));
            }
            k if k.starts_with("app-") => {
                anyhow::ensure!(
                    app_options.len() < MAX_APP_OPTIONS,
                    "line {lineno}: too many app options defined (maximum {MAX_APP_OPTIONS})"
                );
                anyhow::ensure!(!value.is_empty(), "line {lineno}: app option {k:?} has no value");
                app_options.push(AppOption {
                    name: k.to_string(),
                    value: value.to_string(),
                });
            }
            other => anyhow::bail!("line {lineno}: unknown directive {other:?}"),
        }
    }

    let command = command.unwrap_or_default();
    anyhow::ensure!(!command.trim().is_empty(), "no command specified");

    Ok(Config {
        command,
        sockets,
        files,
        app_options,
        environment,
        copies,
    })
}

/// `socket: <name> <ipver> <address> <port> <backlog>`
fn parse_socket_spec(value: &str) -> anyhow::Result<SocketSpec> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    anyhow::ensure!(
        parts.len() == 5,
        "expected 5 fields (name ipver address port backlog), got {}",
        parts.len()
    );

    let name = parts[0].to_string();
    let ip_version = match parts[1] {
        "4" => IpVersion::V4,
        "6" => IpVersion::V6,
        other => anyhow::bail!("ip version must be '4' or '6', got {other:?}"),
    };
    let address: IpAddr = parts[2]
        .parse()
        .with_context(|| format!("invalid network address {:?}", parts[2]))?;
    match (ip_version, address) {
        (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_)) => {}
        _ => anyhow::bail!(
            "address {address} does not match ip version {ip_version}"
        ),
    }
    let port: u16 = parts[3]
        .parse()
        .with_context(|| format!("invalid port number {:?}", parts[3]))?;
    let backlog: i32 = parts[4]
        .parse()
        .with_context(|| format!("invalid backlog {:?}", parts[4]))?;
    anyhow::ensure!(backlog >= 0, "backlog must be >= 0, got {backlog}");

    Ok(SocketSpec {
        name,
        ip_version,
        address,
        port,
        backlog,
    })
}

/// `file: <key> <path>`
fn parse_file_spec(value: &str) -> anyhow::Result<FileSpec> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    anyhow::ensure!(
        parts.len() == 2,
        "expected 2 fields (key path), got {}",
        parts.len()
    );
    Ok(FileSpec {
        key: parts[0].to_string(),
        path: PathBuf::from(parts[1]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = parse(
            "# worker herd\n\
             command: node server.js\n\
             socket: http 4 0.0.0.0 8080 128\n\
             socket: admin 6 ::1 9090 16\n\
             file: cert /etc/ssl/server.pem\n\
             app-verbose: 2\n\
             environment: production\n\
             copies: 4\n",
        )
        .unwrap();

        assert_eq!(cfg.command, "node server.js");
        assert_eq!(cfg.copies, 4);
        assert_eq!(cfg.environment.as_deref(), Some("production"));
        assert_eq!(cfg.sockets.len(), 2);
        assert_eq!(cfg.sockets[0].name, "http");
        assert_eq!(cfg.sockets[0].ip_version, IpVersion::V4);
        assert_eq!(cfg.sockets[0].port, 8080);
        assert_eq!(cfg.sockets[0].backlog, 128);
        assert_eq!(cfg.sockets[1].ip_version, IpVersion::V6);
        assert_eq!(cfg.files.len(), 1);
        assert_eq!(cfg.files[0].key, "cert");
        assert_eq!(cfg.app_options.len(), 1);
        assert_eq!(cfg.app_options[0].name, "app-verbose");
        assert_eq!(cfg.app_options[0].value, "2");
    }

    #[test]
    fn missing_command_is_fatal() {
        let err = parse("copies: 2\n").unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn duplicate_socket_name_is_fatal() {
        let err = parse(
            "command: run\n\
             socket: web 4 127.0.0.1 80 10\n\
             socket: web 4 127.0.0.1 81 10\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate socket name"));
    }

    #[test]
    fn duplicate_file_key_is_fatal() {
        let err = parse(
            "command: run\n\
             file: cert a.pem\n\
             file: cert b.pem\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate file key"));
    }

    #[test]
    fn unknown_directive_is_fatal() {
        let err = parse("command: run\nbogus: 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown directive"));
    }

    #[test]
    fn address_family_must_match_ip_version() {
        let err = parse("command: run\nsocket: web 6 127.0.0.1 80 10\n").unwrap_err();
        assert!(format!("{err:#}").contains("does not match ip version"));
    }

    #[test]
    fn copies_is_clamped_with_a_warning_not_an_error() {
        let cfg = parse("command: run\ncopies: 99\n").unwrap();
        assert_eq!(cfg.copies, MAX_COPIES);
        let cfg = parse("command: run\ncopies: -3\n").unwrap();
        assert_eq!(cfg.copies, 1);
        let cfg = parse("command: run\ncopies: junk\n").unwrap();
        assert_eq!(cfg.copies, 1);
    }

    #[test]
    fn socket_limit_is_enforced() {
        let mut text = String::from("command: run\n");
        for i in 0..=MAX_SOCKETS {
            text.push_str(&format!("socket: s{i} 4 127.0.0.1 {} 10\n", 8000 + i));
        }
        let err = parse(&text).unwrap_err();
        assert!(err.to_string().contains("too many sockets"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let cfg = parse("# a comment\n\ncommand: run\n\n# another\n").unwrap();
        assert_eq!(cfg.command, "run");
        assert_eq!(cfg.copies, 1);
        assert!(cfg.sockets.is_empty());
        assert!(cfg.environment.is_none());
    }
}
