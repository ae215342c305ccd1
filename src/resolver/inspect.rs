//! Process metadata lookups and liveness probing
//!
//! Two backends provide the same view of a process (user, short name and
//! full argument string): the external `ps` tool, which matches what an
//! operator sees on the box, and an in-process sysinfo scan for hosts
//! without procps. Both are bounded by a timeout.

use super::error::ResolveError;
use async_trait::async_trait;
use log::{debug, error};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

/// Identity fields of one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: String,
    pub comm: String,
    pub args: String,
}

impl ProcessInfo {
    /// Same user, short name and argument string
    pub fn same_identity(&self, other: &ProcessInfo) -> bool {
        self.user == other.user && self.comm == other.comm && self.args == other.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    /// Exists but belongs to another user
    AliveNoPermission,
    Dead,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

/// Probe a PID with the null signal.
///
/// EPERM means the process exists under another owner and counts as alive.
pub fn probe_liveness(pid: u32) -> Result<Liveness, ResolveError> {
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Ok(Liveness::Dead),
    };

    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return Ok(Liveness::Alive);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(Liveness::Dead),
        Some(libc::EPERM) => Ok(Liveness::AliveNoPermission),
        _ => Err(ResolveError::LivenessProbeFailed {
            pid,
            message: err.to_string(),
        }),
    }
}

/// Source of process metadata for the resolver
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Metadata of one PID, `None` when no such process is listed
    async fn process_info(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> Result<Option<ProcessInfo>, ResolveError>;

    /// Every visible process, ordered by PID
    async fn list_processes(&self, timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError>;

    fn liveness(&self, pid: u32) -> Result<Liveness, ResolveError> {
        probe_liveness(pid)
    }
}

static LISTING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\S+)\s+(\S+)(?:\s+(.*))?$").expect("listing regex is valid")
});

static INFO_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+)\s+(\S+)(?:\s+(.*))?$").expect("info regex is valid"));

/// Parse `ps -eo pid=,user=,comm=,args=` output. Unparseable lines are skipped.
pub fn parse_ps_listing(output: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = output
        .lines()
        .filter_map(|line| {
            let caps = LISTING_LINE.captures(line.trim_end())?;
            let pid = caps[1].parse::<u32>().ok()?;
            let comm = caps[3].to_string();
            let args = caps
                .get(4)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| comm.clone());
            Some(ProcessInfo {
                pid,
                user: caps[2].to_string(),
                comm,
                args,
            })
        })
        .collect();
    processes.sort_by_key(|p| p.pid);
    processes
}

/// Parse `ps -o user=,comm=,args= -p PID` output
pub fn parse_ps_info(pid: u32, output: &str) -> Option<ProcessInfo> {
    let line = output.lines().find(|line| !line.trim().is_empty())?;
    let caps = INFO_LINE.captures(line.trim_end())?;
    let comm = caps[2].to_string();
    let args = caps
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| comm.clone());
    Some(ProcessInfo {
        pid,
        user: caps[1].to_string(),
        comm,
        args,
    })
}

/// Run a command with a deadline and return its stdout.
///
/// The child is killed when the deadline passes.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, ResolveError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!("cmd.start {}", command);

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            error!("cmd.fail {} reason=timeout", command);
            return Err(ResolveError::CmdTimeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            error!("cmd.fail {} reason=not_found", command);
            return Err(ResolveError::ToolUnavailable { command });
        }
        Ok(Err(e)) => {
            error!("cmd.fail {} reason={}", command, e);
            return Err(ResolveError::CmdFailed {
                command,
                message: e.to_string(),
            });
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("cmd.exit {} code={:?}", command, output.status.code());
        return Err(ResolveError::CmdExit {
            command,
            code: output.status.code(),
            stderr,
        });
    }

    debug!("cmd.ok {}", command);
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Inspector backed by the `ps` tool
#[derive(Debug, Clone)]
pub struct PsInspector {
    program: String,
}

impl Default for PsInspector {
    fn default() -> Self {
        Self {
            program: "ps".to_string(),
        }
    }
}

impl PsInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another executable with ps-compatible output
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ProcessInspector for PsInspector {
    async fn process_info(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> Result<Option<ProcessInfo>, ResolveError> {
        let pid_arg = pid.to_string();
        match run_command(
            &self.program,
            &["-o", "user=,comm=,args=", "-p", &pid_arg],
            timeout,
        )
        .await
        {
            Ok(stdout) => Ok(parse_ps_info(pid, &stdout)),
            // ps exits non-zero when the PID is not listed
            Err(ResolveError::CmdExit { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_processes(&self, timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError> {
        let stdout = run_command(&self.program, &["-eo", "pid=,user=,comm=,args="], timeout).await?;
        Ok(parse_ps_listing(&stdout))
    }
}

/// Inspector backed by an in-process sysinfo scan
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoInspector;

impl SysinfoInspector {
    fn snapshot(pid: Option<u32>) -> Vec<ProcessInfo> {
        let mut system = System::new();
        let refresh = ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_user(UpdateKind::Always);
        let targets = pid.map(Pid::from_u32);
        match targets.as_ref() {
            Some(target) => system.refresh_processes_specifics(
                ProcessesToUpdate::Some(std::slice::from_ref(target)),
                true,
                refresh,
            ),
            None => system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh),
        };
        let users = Users::new_with_refreshed_list();

        let mut processes: Vec<ProcessInfo> = system
            .processes()
            .values()
            .map(|process| {
                let user = process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|u| u.name().to_string())
                    .unwrap_or_default();
                let comm = process.name().to_string_lossy().into_owned();
                let args = if process.cmd().is_empty() {
                    comm.clone()
                } else {
                    process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                ProcessInfo {
                    pid: process.pid().as_u32(),
                    user,
                    comm,
                    args,
                }
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }

    async fn scan(pid: Option<u32>, timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError> {
        let task = tokio::task::spawn_blocking(move || Self::snapshot(pid));
        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(ResolveError::CmdTimeout {
                command: "sysinfo".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(ResolveError::CmdFailed {
                command: "sysinfo".to_string(),
                message: e.to_string(),
            }),
            Ok(Ok(processes)) => Ok(processes),
        }
    }
}

#[async_trait]
impl ProcessInspector for SysinfoInspector {
    async fn process_info(
        &self,
        pid: u32,
        timeout: Duration,
    ) -> Result<Option<ProcessInfo>, ResolveError> {
        let processes = Self::scan(Some(pid), timeout).await?;
        Ok(processes.into_iter().find(|p| p.pid == pid))
    }

    async fn list_processes(&self, timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError> {
        Self::scan(None, timeout).await
    }
}
