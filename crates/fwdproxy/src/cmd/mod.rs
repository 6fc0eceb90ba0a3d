use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::str::FromStr;

use clap::Parser;

pub const DEFAULT_PORT: u16 = 3128;

/// HTTP/1.1 forward proxy with CONNECT tunneling and IP access control.
#[derive(Debug, Parser)]
#[command(name = "fwdproxy", version)]
pub struct Args {
    /// Bind address: host:port, a bare port, or a bare host.
    #[arg(default_value = "0.0.0.0:3128")]
    pub bindaddr: BindAddr,

    /// CIDRs to block, e.g. 1.2.3.4/24 (a bare address means a full prefix).
    #[arg(short, long, num_args = 1..)]
    pub block: Vec<String>,

    /// CIDRs to allow; when given, everything else is rejected.
    #[arg(short, long, num_args = 1..)]
    pub allow: Vec<String>,

    /// Maximum queued requests; above this, answer 503.
    #[arg(short, long)]
    pub max: Option<usize>,

    /// Number of handler threads.
    #[arg(short, long, default_value_t = 1)]
    pub threads: usize,

    /// Per-connection socket timeout in seconds (0 disables it).
    #[arg(long, default_value_t = 60.0)]
    pub timeout: f64,

    /// Log level: off, error, warn, info, debug, trace (or v/vv/vvv).
    #[arg(short = 'v', long = "log-level", default_value = "info")]
    pub log_level: LogLevel,

    /// Color the level in log lines.
    #[arg(long)]
    pub colored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindAddr(SocketAddr);

impl FromStr for BindAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(Self(addr));
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self(SocketAddr::from(([0, 0, 0, 0], port))));
        }
        let candidate = if s.contains(':') {
            s.to_string()
        } else {
            format!("{s}:{DEFAULT_PORT}")
        };
        candidate.to_socket_addrs()
            .map_err(|err| format!("invalid bind address {s:?}: {err}"))?
            .next()
            .map(Self)
            .ok_or_else(|| format!("invalid bind address {s:?}: nothing resolved"))
    }
}

impl Deref for BindAddr {
    type Target = SocketAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct LogLevel(String);

impl FromStr for LogLevel {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "off" => "off",
            "err" | "error" => "error",
            "warn" | "warning" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            other => {
                let count = other.chars().filter(|c| c.eq_ignore_ascii_case(&'v')).count();
                match count {
                    0 => "off",
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                }
            }
        };
        Ok(Self(level.to_string()))
    }
}

impl Deref for LogLevel {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindaddr_forms() {
        let full: BindAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(*full, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());

        let bare_port: BindAddr = "8080".parse().unwrap();
        assert_eq!(*bare_port, SocketAddr::from(([0, 0, 0, 0], 8080)));

        let bare_host: BindAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(*bare_host, SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));

        assert!("definitely not an address".parse::<BindAddr>().is_err());
    }

    #[test]
    fn test_log_level_verbosity_shorthand() {
        assert_eq!(&*"vv".parse::<LogLevel>().unwrap(), "debug");
        assert_eq!(&*"WARN".parse::<LogLevel>().unwrap(), "warn");
        assert_eq!(&*"".parse::<LogLevel>().unwrap(), "off");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "fwdproxy",
            "3129",
            "--allow",
            "10.0.0.0/8",
            "192.168.0.0/16",
            "--max",
            "32",
            "--threads",
            "4",
        ])
        .unwrap();
        assert_eq!(*args.bindaddr, SocketAddr::from(([0, 0, 0, 0], 3129)));
        assert_eq!(args.allow, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(args.max, Some(32));
        assert_eq!(args.threads, 4);
        assert_eq!(args.timeout, 60.0);
    }
}
