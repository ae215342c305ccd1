use async_trait::async_trait;
use pidwatt::resolver::{
    Constraints, Liveness, ProcessIdentityResolver, ProcessInfo, ProcessInspector, ResolveError,
    ResolverOptions, StrictMode, Strategy,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn pid_file(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("target.pid");
    fs::write(&path, content).unwrap();
    path
}

/// Reports a different argument string from the second lookup on
struct ShapeShifter {
    pid: u32,
    lookups: AtomicUsize,
}

impl ShapeShifter {
    fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            lookups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProcessInspector for ShapeShifter {
    async fn process_info(
        &self,
        pid: u32,
        _timeout: Duration,
    ) -> Result<Option<ProcessInfo>, ResolveError> {
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        let args = if n == 0 { "worker --queue a" } else { "intruder" };
        Ok(Some(ProcessInfo {
            pid,
            user: "svc".to_string(),
            comm: "worker".to_string(),
            args: args.to_string(),
        }))
    }

    async fn list_processes(&self, timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError> {
        Ok(self
            .process_info(self.pid, timeout)
            .await?
            .into_iter()
            .collect())
    }

    fn liveness(&self, _pid: u32) -> Result<Liveness, ResolveError> {
        Ok(Liveness::Alive)
    }
}

/// Alive for the first probe only
struct Vanishing {
    probes: AtomicUsize,
}

#[async_trait]
impl ProcessInspector for Vanishing {
    async fn process_info(
        &self,
        _pid: u32,
        _timeout: Duration,
    ) -> Result<Option<ProcessInfo>, ResolveError> {
        Ok(None)
    }

    async fn list_processes(&self, _timeout: Duration) -> Result<Vec<ProcessInfo>, ResolveError> {
        Ok(Vec::new())
    }

    fn liveness(&self, _pid: u32) -> Result<Liveness, ResolveError> {
        if self.probes.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Liveness::Alive)
        } else {
            Ok(Liveness::Dead)
        }
    }
}

#[tokio::test]
async fn test_file_strategy_resolves_own_pid() {
    let tmp = TempDir::new().unwrap();
    let me = std::process::id();
    let path = pid_file(&tmp, &format!("  {}\n", me));

    let resolver = ProcessIdentityResolver::new(&ResolverOptions::from_file(&path)).unwrap();
    let identity = resolver.resolve().await.unwrap();
    assert_eq!(identity.pid, me);
    assert!(identity.info.is_none());
}

#[tokio::test]
async fn test_file_strategy_with_strict_liveness_check() {
    let tmp = TempDir::new().unwrap();
    let me = std::process::id();
    let path = pid_file(&tmp, &me.to_string());

    let opts = ResolverOptions::from_file(&path).with_strict(StrictMode::Delay { delay_ms: 10 });
    let resolver = ProcessIdentityResolver::new(&opts).unwrap();
    assert_eq!(resolver.resolve().await.unwrap().pid, me);
}

#[tokio::test]
async fn test_dead_pid_is_not_alive() {
    let tmp = TempDir::new().unwrap();
    let path = pid_file(&tmp, &i32::MAX.to_string());

    let resolver = ProcessIdentityResolver::new(&ResolverOptions::from_file(&path)).unwrap();
    match resolver.resolve().await {
        Err(ResolveError::PidNotAlive { pid }) => assert_eq!(pid, i32::MAX as u32),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_pid_file_problems() {
    let tmp = TempDir::new().unwrap();

    let empty = pid_file(&tmp, "   \n");
    let resolver = ProcessIdentityResolver::new(&ResolverOptions::from_file(&empty)).unwrap();
    assert_eq!(resolver.resolve().await.unwrap_err().code(), "no_pid_found");

    let missing = tmp.path().join("nope.pid");
    let resolver = ProcessIdentityResolver::new(&ResolverOptions::from_file(&missing)).unwrap();
    assert_eq!(resolver.resolve().await.unwrap_err().code(), "file_read_error");

    let resolver = ProcessIdentityResolver::new(&ResolverOptions::new(Strategy::File)).unwrap();
    assert_eq!(
        resolver.resolve().await.unwrap_err().code(),
        "invalid_file_options"
    );
}

#[tokio::test]
async fn test_strict_detects_identity_change() {
    let tmp = TempDir::new().unwrap();
    let path = pid_file(&tmp, "4242");

    let opts = ResolverOptions::from_file(&path)
        .with_constraints(Constraints {
            user: Some("svc".to_string()),
            ..Default::default()
        })
        .with_strict(StrictMode::Delay { delay_ms: 5 });
    let resolver = ProcessIdentityResolver::with_inspector(&opts, ShapeShifter::new(4242)).unwrap();

    match resolver.resolve().await {
        Err(ResolveError::StrictIdentityChanged { pid, before, after }) => {
            assert_eq!(pid, 4242);
            assert_eq!(before.unwrap().args, "worker --queue a");
            assert_eq!(after.unwrap().args, "intruder");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_strict_second_check_failure() {
    let tmp = TempDir::new().unwrap();
    let path = pid_file(&tmp, "4242");

    let opts = ResolverOptions::from_file(&path).with_strict(StrictMode::Flag(true));
    let inspector = Arc::new(Vanishing {
        probes: AtomicUsize::new(0),
    });
    let resolver = ProcessIdentityResolver::with_inspector(&opts, inspector).unwrap();

    let err = resolver.resolve().await.unwrap_err();
    assert_eq!(err.code(), "strict_verification_failed");
    assert_eq!(err.strict_reason().map(|r| r.code()), Some("pid_not_alive"));
}

#[tokio::test]
async fn test_strict_disabled_accepts_shifting_identity() {
    let tmp = TempDir::new().unwrap();
    let path = pid_file(&tmp, "4242");

    let opts = ResolverOptions::from_file(&path).with_constraints(Constraints {
        user: Some("svc".to_string()),
        ..Default::default()
    });
    let resolver = ProcessIdentityResolver::with_inspector(&opts, ShapeShifter::new(4242)).unwrap();
    assert_eq!(resolver.resolve().await.unwrap().pid, 4242);
}

#[tokio::test]
async fn test_options_are_copied() {
    let tmp = TempDir::new().unwrap();
    let path = pid_file(&tmp, &std::process::id().to_string());

    let mut opts = ResolverOptions::from_file(&path);
    let before = opts.clone();
    let resolver = ProcessIdentityResolver::new(&opts).unwrap();
    assert_eq!(opts, before);

    opts.strategy = Strategy::Port;
    opts.ensure_unique = true;
    let mut snapshot = resolver.options();
    assert_eq!(snapshot, before);

    snapshot.strategy = Strategy::Env;
    assert_eq!(resolver.options().strategy, Strategy::File);
    assert!(resolver.resolve().await.is_ok());
}

#[tokio::test]
async fn test_unimplemented_strategies() {
    for strategy in [Strategy::Env, Strategy::Port] {
        let resolver = ProcessIdentityResolver::new(&ResolverOptions::new(strategy)).unwrap();
        match resolver.resolve().await {
            Err(ResolveError::NotImplemented { strategy: s }) => assert_eq!(s, strategy),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_command_strategy_without_match() {
    let opts = ResolverOptions::from_command("pidwatt-no-process-has-this-name-8c1f");
    let resolver = ProcessIdentityResolver::with_inspector(
        &opts,
        Arc::new(pidwatt::resolver::SysinfoInspector),
    )
    .unwrap();
    assert_eq!(resolver.resolve().await.unwrap_err().code(), "no_match");
}
