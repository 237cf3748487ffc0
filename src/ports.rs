//! Port allocation and discovery.
//!
//! A server either takes the port devrack injects through `{PORT}`, or picks
//! one itself. In both cases the port recorded is the one it actually bound,
//! discovered after launch from (in order) the OS listener table, a port
//! announcement in its output, and finally the planned port.

use std::fmt;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::process::Command;

use regex::Regex;
use tracing::debug;

use crate::config::ServerDefinition;
use crate::error::{DevError, Result};
use crate::output::OutputCapture;

/// Number of consecutive ports [`find_free_port`] considers.
pub const PORT_SCAN_WINDOW: u32 = 100;
/// Matches dev-server banners such as `Local:   http://localhost:5173/`.
pub const DEFAULT_ANNOUNCEMENT: &str = r"Local:\s+http://localhost:(\d+)";

/// OS-level view of TCP listeners.
pub trait PortProbe: Send + Sync {
    /// Whether anything currently listens on `port`.
    fn is_listening(&self, port: u16) -> bool;

    /// Ports in LISTEN state owned by the process group led by `pid`.
    ///
    /// Returns `None` when the listener table could not be inspected.
    fn listening_ports(&self, pid: u32) -> Option<Vec<u16>>;
}

/// [`PortProbe`] backed by bind attempts and `lsof`/`ss`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortProbe for SystemPorts {
    fn is_listening(&self, port: u16) -> bool {
        // Binding 127.0.0.1 can succeed on macOS while 0.0.0.0 is taken, so try both.
        let localhost_free = TcpListener::bind(("127.0.0.1", port)).is_ok();
        let any_free = TcpListener::bind(("0.0.0.0", port)).is_ok();
        // Servers binding `localhost` often end up on ::1 only.
        !(localhost_free && any_free && ipv6_free("::1", port) && ipv6_free("::", port))
    }

    fn listening_ports(&self, pid: u32) -> Option<Vec<u16>> {
        lsof_listening_ports(pid).or_else(|| ss_listening_ports(pid))
    }
}

// A host without IPv6 reports the address as unavailable; only a taken port counts.
fn ipv6_free(addr: &str, port: u16) -> bool {
    match TcpListener::bind((addr, port)) {
        Ok(_) => true,
        Err(err) => err.kind() != io::ErrorKind::AddrInUse,
    }
}

fn lsof_listening_ports(pid: u32) -> Option<Vec<u16>> {
    // `-g` selects the whole process group so a server forked by `sh -c` is included.
    let output = Command::new("lsof")
        .args(["-nP", "-a", "-iTCP", "-sTCP:LISTEN"])
        .arg(format!("-g{}", pid))
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let ports = parse_lsof_listen(&stdout);
    if ports.is_empty() {
        None
    } else {
        Some(ports)
    }
}

fn ss_listening_ports(pid: u32) -> Option<Vec<u16>> {
    let output = Command::new("ss").args(["-tlnpH"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    // `ss` reports owning pids, not process groups.
    Some(parse_ss_listen(&stdout, &process_group_members(pid)))
}

/// Pids in the process group `pgid`, the leader first.
fn process_group_members(pgid: u32) -> Vec<u32> {
    let mut members = vec![pgid];
    let Ok(entries) = fs::read_dir("/proc") else {
        return members;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == pgid {
            continue;
        }
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if parse_stat_pgrp(&stat) == Some(pgid) {
            members.push(pid);
        }
    }
    members
}

/// Process group id from a `/proc/<pid>/stat` line.
pub fn parse_stat_pgrp(stat: &str) -> Option<u32> {
    // comm may contain spaces and parentheses; fields resume after the last `)`.
    let (_, rest) = stat.rsplit_once(')')?;
    // state ppid pgrp ...
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Extracts listening ports from `lsof -nP` output, in order of appearance.
pub fn parse_lsof_listen(output: &str) -> Vec<u16> {
    let Ok(pattern) = Regex::new(r":(\d+)\s+\(LISTEN\)") else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    for captures in pattern.captures_iter(output) {
        if let Some(port) = captures.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Extracts ports from `ss -tlnpH` lines whose users include any of `pids`.
pub fn parse_ss_listen(output: &str, pids: &[u32]) -> Vec<u16> {
    let needles: Vec<String> = pids.iter().map(|pid| format!("pid={},", pid)).collect();
    let mut ports = Vec::new();
    for line in output.lines() {
        if !needles.iter().any(|needle| line.contains(needle.as_str())) {
            continue;
        }
        // State Recv-Q Send-Q Local:Port Peer:Port Process
        let Some(local) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some(port) = local
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            continue;
        };
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// Returns the first port in `[start, start + 100)` with no listener.
pub fn find_free_port(start: u16, probe: &dyn PortProbe) -> Result<u16> {
    let end = (u32::from(start) + PORT_SCAN_WINDOW).min(u32::from(u16::MAX) + 1);
    for candidate in u32::from(start)..end {
        let Ok(port) = u16::try_from(candidate) else {
            break;
        };
        if !probe.is_listening(port) {
            return Ok(port);
        }
        debug!(port, "port in use");
    }
    Err(DevError::NoFreePort { start, end })
}

/// The first port `pid` is listening on, or `fallback` if none can be found.
pub fn detect_bound_port(pid: u32, fallback: u16, probe: &dyn PortProbe) -> u16 {
    probe
        .listening_ports(pid)
        .and_then(|ports| ports.first().copied())
        .unwrap_or(fallback)
}

/// A regular expression whose first capture group is an announced port.
#[derive(Debug, Clone)]
pub struct AnnouncementPattern {
    regex: Regex,
}

impl AnnouncementPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|err| DevError::InvalidPattern(err.to_string()))?;
        if regex.captures_len() < 2 {
            return Err(DevError::InvalidPattern(format!(
                "`{}` needs a capture group for the port",
                pattern
            )));
        }
        Ok(Self { regex })
    }

    /// First announced port in `text`.
    pub fn detect(&self, text: &str) -> Option<u16> {
        self.regex
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .find_map(|m| m.as_str().parse::<u16>().ok())
    }

    /// First announced port across the captured lines.
    pub fn detect_in(&self, output: &OutputCapture) -> Option<u16> {
        output.iter().find_map(|line| self.detect(line))
    }
}

/// How the port passed to a server was chosen before launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPlan {
    /// Allocated by devrack and substituted into `{PORT}`.
    Assigned(u16),
    /// The server picks its own port; this is the configured fallback.
    SelfSelected(u16),
}

impl PortPlan {
    pub fn for_server(server: &ServerDefinition, probe: &dyn PortProbe) -> Result<Self> {
        if server.takes_port() {
            find_free_port(server.preferred_port, probe).map(PortPlan::Assigned)
        } else {
            Ok(PortPlan::SelfSelected(server.preferred_port))
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            PortPlan::Assigned(port) | PortPlan::SelfSelected(port) => *port,
        }
    }

    fn source(&self) -> PortSource {
        match self {
            PortPlan::Assigned(_) => PortSource::Assigned,
            PortPlan::SelfSelected(_) => PortSource::Preferred,
        }
    }
}

/// Which signal determined a server's effective port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Listener,
    Announcement,
    Assigned,
    Preferred,
}

impl fmt::Display for PortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PortSource::Listener => "detected from listening socket",
            PortSource::Announcement => "detected from server output",
            PortSource::Assigned => "assigned",
            PortSource::Preferred => "configured port",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub port: u16,
    pub source: PortSource,
}

/// Decides which port a launched server is actually using.
pub fn resolve_effective_port(
    pid: u32,
    plan: PortPlan,
    output: &OutputCapture,
    probe: &dyn PortProbe,
    pattern: &AnnouncementPattern,
) -> ResolvedPort {
    // Port 0 is never reported as listening, so it marks "no listener found".
    let port = detect_bound_port(pid, 0, probe);
    if port != 0 {
        return ResolvedPort {
            port,
            source: PortSource::Listener,
        };
    }
    if let Some(port) = pattern.detect_in(output) {
        return ResolvedPort {
            port,
            source: PortSource::Announcement,
        };
    }
    ResolvedPort {
        port: plan.port(),
        source: plan.source(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct FakeProbe {
        busy: HashSet<u16>,
        listening: Option<Vec<u16>>,
    }

    impl FakeProbe {
        fn busy(ports: impl IntoIterator<Item = u16>) -> Self {
            Self {
                busy: ports.into_iter().collect(),
                listening: None,
            }
        }
    }

    impl PortProbe for FakeProbe {
        fn is_listening(&self, port: u16) -> bool {
            self.busy.contains(&port)
        }

        fn listening_ports(&self, _pid: u32) -> Option<Vec<u16>> {
            self.listening.clone()
        }
    }

    fn server(command: &str, preferred_port: u16) -> ServerDefinition {
        ServerDefinition {
            command: command.into(),
            preferred_port,
            health_check_url: "http://localhost:{PORT}".into(),
        }
    }

    #[test]
    fn finds_first_free_port_ascending() {
        let probe = FakeProbe::busy([3000, 3001, 3003]);
        assert_eq!(find_free_port(3000, &probe).unwrap(), 3002);
        assert_eq!(find_free_port(3003, &probe).unwrap(), 3004);
    }

    #[test]
    fn fails_when_window_is_full() {
        let probe = FakeProbe::busy(4000..4100);
        assert!(matches!(
            find_free_port(4000, &probe),
            Err(DevError::NoFreePort { start: 4000, end: 4100 })
        ));
        assert_eq!(find_free_port(4001, &probe).unwrap(), 4100);
    }

    #[test]
    fn window_stops_at_highest_port() {
        let probe = FakeProbe::busy(65500..=u16::MAX);
        assert!(matches!(
            find_free_port(65500, &probe),
            Err(DevError::NoFreePort { end: 65536, .. })
        ));
    }

    #[test]
    fn system_probe_sees_bound_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SystemPorts.is_listening(port));
        let free = find_free_port(port, &SystemPorts).unwrap();
        assert!(free > port);
    }

    #[test]
    fn system_probe_sees_ipv6_loopback_listener() {
        // Hosts without IPv6 cannot hold the listener at all.
        let Ok(listener) = TcpListener::bind(("::1", 0)) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        assert!(SystemPorts.is_listening(port));
        assert_ne!(find_free_port(port, &SystemPorts).unwrap(), port);
    }

    #[test]
    fn bound_port_falls_back_without_listener() {
        let probe = FakeProbe::busy([]);
        assert_eq!(detect_bound_port(1234, 3000, &probe), 3000);
        let probe = FakeProbe {
            busy: HashSet::new(),
            listening: Some(Vec::new()),
        };
        assert_eq!(detect_bound_port(1234, 3000, &probe), 3000);
        let probe = FakeProbe {
            busy: HashSet::new(),
            listening: Some(vec![5174, 24678]),
        };
        assert_eq!(detect_bound_port(1234, 3000, &probe), 5174);
    }

    #[test]
    fn unknown_pid_has_no_listeners() {
        assert_eq!(detect_bound_port(u32::MAX - 1, 4321, &SystemPorts), 4321);
    }

    #[test]
    fn parses_lsof_listen_lines() {
        let output = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
node    41230 dev   23u  IPv6 0x1234      0t0  TCP [::1]:5173 (LISTEN)
node    41230 dev   24u  IPv4 0x1235      0t0  TCP 127.0.0.1:5173 (LISTEN)
node    41230 dev   25u  IPv4 0x1236      0t0  TCP *:24678 (LISTEN)
";
        assert_eq!(parse_lsof_listen(output), vec![5173, 24678]);
        assert!(parse_lsof_listen("").is_empty());
    }

    #[test]
    fn parses_ss_lines_for_pid() {
        let output = "\
LISTEN 0 511 127.0.0.1:3000 0.0.0.0:* users:((\"node\",pid=812,fd=21))
LISTEN 0 511 [::]:8080 [::]:* users:((\"python3\",pid=9001,fd=3))
LISTEN 0 128 *:3001 *:* users:((\"node\",pid=812,fd=22))
";
        assert_eq!(parse_ss_listen(output, &[812]), vec![3000, 3001]);
        assert_eq!(parse_ss_listen(output, &[9001]), vec![8080]);
        assert!(parse_ss_listen(output, &[81]).is_empty());
    }

    #[test]
    fn ss_lines_match_any_group_member() {
        // `sh -c` leads the group; the server it forked owns the socket.
        let output = "\
LISTEN 0 511 127.0.0.1:3000 0.0.0.0:* users:((\"node\",pid=813,fd=21))
LISTEN 0 511 [::]:8080 [::]:* users:((\"python3\",pid=9001,fd=3))
";
        assert!(parse_ss_listen(output, &[812]).is_empty());
        assert_eq!(parse_ss_listen(output, &[812, 813]), vec![3000]);
    }

    #[test]
    fn parses_pgrp_from_proc_stat() {
        assert_eq!(
            parse_stat_pgrp("813 (node) S 812 812 812 0 -1 4194560 1470 0"),
            Some(812)
        );
        assert_eq!(parse_stat_pgrp("77 (npm run (dev)) R 70 70 12 0 -1"), Some(70));
        assert_eq!(parse_stat_pgrp("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn group_members_include_forked_children() {
        use crate::events::ProcessSignal;
        use crate::process::{OsSupervisor, Supervisor};

        let dir = tempfile::tempdir().unwrap();
        let supervisor = OsSupervisor::new();
        let pid = supervisor.spawn("sleep 30 & wait", dir.path()).unwrap();
        let mut members = Vec::new();
        for _ in 0..50 {
            members = process_group_members(pid);
            if members.len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        supervisor.terminate(pid, ProcessSignal::SigTerm);
        assert_eq!(members[0], pid);
        assert!(members.len() >= 2, "forked sleep missing from {:?}", members);
    }

    #[test]
    fn announcement_matches_dev_server_banners() {
        let pattern = AnnouncementPattern::new(DEFAULT_ANNOUNCEMENT).unwrap();
        let next = "\n   ▲ Next.js 14.0.0\n   - Local:        http://localhost:3000\n   - Network:      http://192.168.1.100:3000\n";
        assert_eq!(pattern.detect(next), Some(3000));
        assert_eq!(pattern.detect("Local:  http://localhost:4000"), Some(4000));
        assert_eq!(pattern.detect("Local:        http://localhost:65535"), Some(65535));
        assert_eq!(
            pattern.detect("  VITE v5.0.0  ready in 200 ms\n\n  ➜  Local:   http://localhost:5173/\n"),
            Some(5173)
        );
        assert_eq!(
            pattern.detect("- Local: http://localhost:3000\n- Local: http://localhost:3001"),
            Some(3000)
        );
        assert_eq!(pattern.detect("Local:        http://127.0.0.1:3000"), None);
        assert_eq!(pattern.detect("Server starting..."), None);
    }

    #[test]
    fn custom_announcement_needs_capture_group() {
        assert!(AnnouncementPattern::new(r"listening on \d+").is_err());
        assert!(AnnouncementPattern::new(r"(").is_err());
        let pattern = AnnouncementPattern::new(r"listening on (\d+)").unwrap();
        assert_eq!(pattern.detect("api listening on 8081"), Some(8081));
    }

    #[test]
    fn port_plan_follows_placeholder() {
        let probe = FakeProbe::busy([3000]);
        assert_eq!(
            PortPlan::for_server(&server("serve --port {PORT}", 3000), &probe).unwrap(),
            PortPlan::Assigned(3001)
        );
        assert_eq!(
            PortPlan::for_server(&server("vite", 3000), &probe).unwrap(),
            PortPlan::SelfSelected(3000)
        );
    }

    #[test]
    fn effective_port_priority() {
        let pattern = AnnouncementPattern::new(DEFAULT_ANNOUNCEMENT).unwrap();
        let mut output = OutputCapture::new(10);
        output.push("  ➜  Local:   http://localhost:5174/".into());

        let listening = FakeProbe {
            busy: HashSet::new(),
            listening: Some(vec![5175]),
        };
        let resolved =
            resolve_effective_port(1, PortPlan::SelfSelected(5173), &output, &listening, &pattern);
        assert_eq!(resolved, ResolvedPort { port: 5175, source: PortSource::Listener });

        let silent = FakeProbe::busy([]);
        let resolved =
            resolve_effective_port(1, PortPlan::SelfSelected(5173), &output, &silent, &pattern);
        assert_eq!(resolved, ResolvedPort { port: 5174, source: PortSource::Announcement });

        let empty = OutputCapture::new(10);
        let resolved = resolve_effective_port(1, PortPlan::Assigned(3002), &empty, &silent, &pattern);
        assert_eq!(resolved, ResolvedPort { port: 3002, source: PortSource::Assigned });
        let resolved =
            resolve_effective_port(1, PortPlan::SelfSelected(5173), &empty, &silent, &pattern);
        assert_eq!(resolved, ResolvedPort { port: 5173, source: PortSource::Preferred });
    }
}
