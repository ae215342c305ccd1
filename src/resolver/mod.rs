//! Target process identity resolution
//!
//! Turns a [`ResolverOptions`] description into a live PID. A PID file or a
//! command-name pattern yields a candidate, which is then checked for
//! liveness and against the configured identity constraints. With strict
//! mode on, the whole check runs a second time after a short delay and the
//! two observations must agree, so a PID recycled in between is rejected.

pub mod error;
pub mod inspect;
pub mod options;

pub use error::ResolveError;
pub use inspect::{
    probe_liveness, Liveness, ProcessInfo, ProcessInspector, PsInspector, SysinfoInspector,
};
pub use options::{
    CommandOptions, Constraints, FileOptions, InspectorKind, Pick, ResolverOptions, StrictMode,
    Strategy,
};

use crate::error::{PidwattError, Result};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Successful resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub pid: u32,
    /// Present when `return_info` was requested and the lookup succeeded
    pub info: Option<ProcessInfo>,
}

static PID_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([1-9]\d*)\s*$").expect("pid regex is valid"));

/// Extract a PID from PID-file content.
///
/// The content must be a single positive decimal integer, optionally
/// surrounded by whitespace, that fits the platform `pid_t`.
pub fn parse_pid_file(path: &Path, content: &str) -> std::result::Result<u32, ResolveError> {
    let path_str = path.display().to_string();
    let caps = PID_LINE
        .captures(content)
        .ok_or_else(|| ResolveError::NoPidFound {
            path: path_str.clone(),
        })?;
    let raw = &caps[1];
    match raw.parse::<libc::pid_t>() {
        Ok(pid) if pid > 0 => Ok(pid as u32),
        _ => Err(ResolveError::InvalidPidInFile {
            path: path_str,
            raw: raw.to_string(),
        }),
    }
}

/// Resolves the target PID on demand.
///
/// The resolver keeps its own copy of the options; callers may reuse or
/// change theirs freely.
pub struct ProcessIdentityResolver {
    options: ResolverOptions,
    cmd_regex: Option<Regex>,
    inspector: Arc<dyn ProcessInspector>,
}

impl std::fmt::Debug for ProcessIdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIdentityResolver")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ProcessIdentityResolver {
    /// Create a resolver using the inspector named in the options
    pub fn new(options: &ResolverOptions) -> Result<Self> {
        let inspector: Arc<dyn ProcessInspector> = match options.inspector {
            InspectorKind::Ps => Arc::new(PsInspector::new()),
            InspectorKind::Sysinfo => Arc::new(SysinfoInspector),
        };
        Self::with_inspector(options, inspector)
    }

    /// Create a resolver with a caller-supplied inspector
    pub fn with_inspector(
        options: &ResolverOptions,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        let cmd_regex = match options.constraints.cmd_pattern.as_deref() {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                PidwattError::InvalidConfiguration(format!(
                    "constraints.cmd_pattern {:?}: {}",
                    pattern, e
                ))
            })?),
            None => None,
        };

        Ok(Self {
            options: options.clone(),
            cmd_regex,
            inspector,
        })
    }

    /// Copy of the options this resolver was built with
    pub fn options(&self) -> ResolverOptions {
        self.options.clone()
    }

    /// Resolve the target PID
    pub async fn resolve(&self) -> std::result::Result<ResolvedIdentity, ResolveError> {
        let result = match self.options.strategy {
            Strategy::File => self.resolve_from_file().await,
            Strategy::Command => self.resolve_from_command().await,
            strategy @ (Strategy::Env | Strategy::Port) => {
                Err(ResolveError::NotImplemented { strategy })
            }
        };

        match &result {
            Ok(identity) => info!(
                "resolve.ok strategy={:?} pid={}",
                self.options.strategy, identity.pid
            ),
            Err(e) => warn!(
                "resolve.fail strategy={:?} code={} {}",
                self.options.strategy,
                e.code(),
                e
            ),
        }
        result
    }

    async fn resolve_from_file(&self) -> std::result::Result<ResolvedIdentity, ResolveError> {
        let file = self
            .options
            .file
            .as_ref()
            .filter(|f| !f.path.as_os_str().is_empty())
            .ok_or(ResolveError::InvalidFileOptions)?;

        debug!("file.read.start {}", file.path.display());
        let content = tokio::fs::read_to_string(&file.path).await.map_err(|e| {
            ResolveError::FileReadError {
                path: file.path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        let pid = parse_pid_file(&file.path, &content)?;
        debug!("file.read.ok {} pid={}", file.path.display(), pid);

        self.confirm(pid).await
    }

    async fn resolve_from_command(&self) -> std::result::Result<ResolvedIdentity, ResolveError> {
        let command = self
            .options
            .command
            .as_ref()
            .filter(|c| !c.pattern.is_empty())
            .ok_or(ResolveError::InvalidCommandOptions)?;

        let processes = self.inspector.list_processes(self.options.timeout()).await?;
        let matcher = CommandMatcher::new(command);
        let candidates: Vec<&ProcessInfo> = processes.iter().filter(|p| matcher.matches(p)).collect();
        debug!(
            "command.match pattern={:?} candidates={}",
            command.pattern,
            candidates.len()
        );

        let selected = match candidates.as_slice() {
            [] => {
                return Err(ResolveError::NoMatch {
                    pattern: command.pattern.clone(),
                })
            }
            [only] => only.pid,
            many if self.options.ensure_unique => {
                return Err(ResolveError::MultipleMatches {
                    count: many.len(),
                    pids: many.iter().map(|p| p.pid).collect(),
                })
            }
            many => {
                // Candidates are ordered by PID
                let chosen = match command.pick {
                    Pick::First | Pick::Oldest => many[0].pid,
                    Pick::Newest => many[many.len() - 1].pid,
                };
                warn!(
                    "command.ambiguous pattern={:?} matches={} picked={}",
                    command.pattern,
                    many.len(),
                    chosen
                );
                chosen
            }
        };

        self.confirm(selected).await
    }

    /// Liveness, constraints, optional strict re-check, optional info
    async fn confirm(&self, pid: u32) -> std::result::Result<ResolvedIdentity, ResolveError> {
        if !self.inspector.liveness(pid)?.is_alive() {
            return Err(ResolveError::PidNotAlive { pid });
        }

        let first = self.check_constraints(pid).await?;
        let second = self.revalidate(pid, first.as_ref()).await?;

        let info = if self.options.return_info {
            match second.or(first) {
                Some(info) => Some(info),
                None => self
                    .inspector
                    .process_info(pid, self.options.timeout())
                    .await
                    .unwrap_or_else(|e| {
                        warn!("info.fetch.fail pid={} {}", pid, e);
                        None
                    }),
            }
        } else {
            None
        };

        Ok(ResolvedIdentity { pid, info })
    }

    /// Check the configured constraints. Without constraints no metadata
    /// is fetched and `None` is returned.
    async fn check_constraints(
        &self,
        pid: u32,
    ) -> std::result::Result<Option<ProcessInfo>, ResolveError> {
        let constraints = &self.options.constraints;
        if constraints.is_empty() {
            return Ok(None);
        }

        let info = self
            .inspector
            .process_info(pid, self.options.timeout())
            .await?
            .ok_or(ResolveError::ProcessInfoNotFound { pid })?;

        if !constraints.name.is_empty() && !constraints.name.contains(&info.comm) {
            return Err(ResolveError::ConstraintNameMismatch {
                expected: constraints.name.clone(),
                actual: info.comm,
            });
        }

        if let Some(regex) = &self.cmd_regex {
            if !regex.is_match(&info.args) {
                return Err(ResolveError::ConstraintCmdMismatch {
                    pattern: regex.as_str().to_string(),
                    actual: info.args,
                });
            }
        }

        if let Some(user) = &constraints.user {
            if &info.user != user {
                return Err(ResolveError::ConstraintUserMismatch {
                    expected: user.clone(),
                    actual: info.user,
                });
            }
        }

        Ok(Some(info))
    }

    /// Second check after the strict delay. Returns the fresh metadata when
    /// constraints are configured.
    async fn revalidate(
        &self,
        pid: u32,
        first: Option<&ProcessInfo>,
    ) -> std::result::Result<Option<ProcessInfo>, ResolveError> {
        let Some(delay) = self.options.strict.delay() else {
            return Ok(None);
        };
        debug!("strict.wait pid={} delay_ms={}", pid, delay.as_millis());
        tokio::time::sleep(delay).await;

        let failed = |reason: ResolveError| {
            error!("strict.fail pid={} code={}", pid, reason.code());
            ResolveError::StrictVerificationFailed {
                pid,
                reason: Box::new(reason),
            }
        };

        if self.options.constraints.is_empty() {
            return match self.inspector.liveness(pid) {
                Ok(liveness) if liveness.is_alive() => {
                    debug!("strict.ok pid={}", pid);
                    Ok(None)
                }
                Ok(_) => Err(failed(ResolveError::PidNotAlive { pid })),
                Err(e) => Err(failed(e)),
            };
        }

        let second = self.check_constraints(pid).await.map_err(failed)?;
        match (first, second) {
            (Some(before), Some(after)) if before.same_identity(&after) => {
                debug!("strict.ok pid={}", pid);
                Ok(Some(after))
            }
            (before, after) => {
                error!("strict.identity_changed pid={}", pid);
                Err(ResolveError::StrictIdentityChanged {
                    pid,
                    before: before.cloned(),
                    after,
                })
            }
        }
    }
}

/// Substring matcher for the command strategy
struct CommandMatcher<'a> {
    needle: String,
    options: &'a CommandOptions,
}

impl<'a> CommandMatcher<'a> {
    fn new(options: &'a CommandOptions) -> Self {
        let needle = if options.case_sensitive {
            options.pattern.clone()
        } else {
            options.pattern.to_lowercase()
        };
        Self { needle, options }
    }

    fn matches(&self, process: &ProcessInfo) -> bool {
        let haystack = if self.options.full_command {
            &process.args
        } else {
            &process.comm
        };
        if self.options.case_sensitive {
            haystack.contains(&self.needle)
        } else {
            haystack.to_lowercase().contains(&self.needle)
        }
    }
}
