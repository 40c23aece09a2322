//! Liveness probing: is the service reachable, and who holds its port.

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use regex::Regex;

use super::os_cmd::{run_captured, ProbeError};
use super::{CONNECT_TIMEOUT, OS_COMMAND_TIMEOUT};

pub trait PortProbe: Send + Sync {
    /// Whether something answers on the loopback port, or at least holds it.
    fn is_reachable(&self, port: u16) -> bool;

    /// PIDs bound to `port` in LISTEN or ESTABLISHED state. Never cached.
    fn find_pids_by_port(&self, port: u16) -> BTreeSet<u32>;
}

/// Probe backed by a TCP connect, the OS socket table and `netstat`/`lsof`.
pub struct SystemProbe {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            command_timeout: OS_COMMAND_TIMEOUT,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProbe for SystemProbe {
    fn is_reachable(&self, port: u16) -> bool {
        if connect_loopback(port, self.connect_timeout) {
            return true;
        }
        !self.find_pids_by_port(port).is_empty()
    }

    fn find_pids_by_port(&self, port: u16) -> BTreeSet<u32> {
        match pids_from_socket_table(port) {
            Ok(mut pids) => {
                // The socket table can miss rows for elevated processes on Windows.
                if cfg!(target_os = "windows") {
                    match pids_from_os_command(port, self.command_timeout) {
                        Ok(extra) => pids.extend(extra),
                        Err(e) => log::debug!("netstat cross-check for port {port}: {e}"),
                    }
                }
                pids
            }
            Err(e) => {
                log::debug!("Socket table lookup for port {port}: {e}, trying OS command");
                pids_from_os_command(port, self.command_timeout).unwrap_or_else(|e| {
                    log::debug!("OS command lookup for port {port}: {e}");
                    BTreeSet::new()
                })
            }
        }
    }
}

fn connect_loopback(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

fn pids_from_socket_table(port: u16) -> Result<BTreeSet<u32>, ProbeError> {
    use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState};

    let sockets = get_sockets_info(
        AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
        ProtocolFlags::TCP,
    )
    .map_err(|e| ProbeError::Unavailable(e.to_string()))?;

    let mut pids = BTreeSet::new();
    for socket in sockets {
        let ProtocolSocketInfo::Tcp(tcp) = &socket.protocol_socket_info else {
            continue;
        };
        if tcp.local_port != port {
            continue;
        }
        // TIME_WAIT and friends linger after a socket is closed.
        if !matches!(tcp.state, TcpState::Listen | TcpState::Established) {
            continue;
        }
        pids.extend(socket.associated_pids.iter().copied().filter(|&pid| pid != 0));
    }
    Ok(pids)
}

#[cfg(target_os = "windows")]
fn pids_from_os_command(port: u16, timeout: Duration) -> Result<BTreeSet<u32>, ProbeError> {
    let output = run_captured("netstat", &["-ano", "-p", "TCP"], timeout)?;
    Ok(parse_netstat_pids(&output, port))
}

#[cfg(not(target_os = "windows"))]
fn pids_from_os_command(port: u16, timeout: Duration) -> Result<BTreeSet<u32>, ProbeError> {
    // lsof -i matches remote ports too, so only listeners are trusted here.
    let selector = format!("-iTCP:{port}");
    match run_captured("lsof", &["-t", "-nP", &selector, "-sTCP:LISTEN"], timeout) {
        Ok(output) => Ok(parse_pid_lines(&output)),
        // lsof exits 1 when nothing matches.
        Err(ProbeError::Failed(_)) => Ok(BTreeSet::new()),
        Err(e) => Err(e),
    }
}

/// Extract owning PIDs from `netstat -ano` output for rows whose local
/// address ends in exactly `:port` and whose state is LISTENING or ESTABLISHED.
pub fn parse_netstat_pids(output: &str, port: u16) -> BTreeSet<u32> {
    let pattern = format!(
        r"(?i)^\s*TCP\s+\S*:{port}\s+\S+\s+(?:LISTENING|ESTABLISHED)\s+(\d+)\s*$"
    );
    let Ok(re) = Regex::new(&pattern) else {
        return BTreeSet::new();
    };

    output
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .filter(|&pid| pid != 0)
        .collect()
}

#[cfg_attr(target_os = "windows", allow(dead_code))]
fn parse_pid_lines(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}
