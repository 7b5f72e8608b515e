//! Shared fixtures: a scripted scheduler and a mock host with a proc tree,
//! passwd file and cgroup hierarchy

use async_trait::async_trait;
use std::path::PathBuf;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::EbpfConfig;
use crate::observability::StructuredLogger;
use crate::resolver::{
    CommandError, CommandRunner, FallbackResolver, JobResolver, ProcessTable, SlurmClient,
    TtlCache,
};

/// Answers commands by substring match on `program args...`
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Vec<(String, Result<String, CommandError>)>,
    /// `(pattern, nth matching call, error)`, checked before `rules`
    failures: Vec<(String, usize, CommandError)>,
    /// Calls after the first `n` take `delay`
    slow: Option<(usize, Duration)>,
    matched: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    pub(crate) fn on(mut self, pattern: &str, result: Result<&str, CommandError>) -> Self {
        self.rules
            .push((pattern.to_string(), result.map(|s| s.to_string())));
        self
    }

    /// Fail only the `nth` (1-based) call matching `pattern`
    pub(crate) fn fail_call(mut self, pattern: &str, nth: usize, error: CommandError) -> Self {
        self.failures.push((pattern.to_string(), nth, error));
        self
    }

    pub(crate) fn slow_after(mut self, calls: usize, delay: Duration) -> Self {
        self.slow = Some((calls, delay));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<String, CommandError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((after, delay)) = self.slow {
            if call >= after {
                tokio::time::sleep(delay).await;
            }
        }

        let line = format!("{program} {}", args.join(" "));
        for (pattern, nth, error) in &self.failures {
            if line.contains(pattern.as_str()) {
                let mut matched = self.matched.lock().unwrap();
                let seen = matched.entry(pattern.clone()).or_insert(0);
                *seen += 1;
                if *seen == *nth {
                    return Err(error.clone());
                }
            }
        }
        self.rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Err(CommandError::NotFound(program.to_string())))
    }
}

pub(crate) struct MockHost {
    dir: TempDir,
}

impl MockHost {
    pub(crate) fn new() -> Self {
        let host = Self {
            dir: TempDir::new().unwrap(),
        };
        std::fs::create_dir_all(host.proc().join("sys/kernel")).unwrap();
        std::fs::write(host.proc().join("sys/kernel/hostname"), "node01\n").unwrap();
        std::fs::write(
            host.passwd(),
            "root:x:0:0:root:/root:/bin/bash\n\
             nobody:x:65534:65534::/nonexistent:/usr/sbin/nologin\n\
             alice:x:1001:100::/home/alice:/bin/bash\n\
             bob:x:1002:100::/home/bob:/bin/bash\n",
        )
        .unwrap();
        host
    }

    pub(crate) fn proc(&self) -> PathBuf {
        self.dir.path().join("proc")
    }

    pub(crate) fn passwd(&self) -> PathBuf {
        self.dir.path().join("passwd")
    }

    pub(crate) fn cgroup(&self) -> PathBuf {
        self.dir.path().join("cgroup")
    }

    pub(crate) fn process(&self, pid: u32, ppid: u32, uid: u32, comm: &str, env: &[(&str, &str)]) -> &Self {
        self.process_with(pid, ppid, uid, comm, env, 'S', 0x400100)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process_with(
        &self,
        pid: u32,
        ppid: u32,
        uid: u32,
        comm: &str,
        env: &[(&str, &str)],
        state: char,
        flags: u64,
    ) -> &Self {
        let dir = self.proc().join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) {state} {ppid} {pid} {pid} 0 -1 {flags} 0 0 0 0 0 0"),
        )
        .unwrap();
        std::fs::write(
            dir.join("status"),
            format!("Name:\t{comm}\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
        )
        .unwrap();
        let environ: Vec<u8> = env
            .iter()
            .flat_map(|(k, v)| format!("{k}={v}\0").into_bytes())
            .collect();
        std::fs::write(dir.join("environ"), environ).unwrap();
        self
    }

    pub(crate) fn exit(&self, pid: u32) {
        std::fs::remove_dir_all(self.proc().join(pid.to_string())).unwrap();
    }

    pub(crate) fn table(&self) -> ProcessTable {
        ProcessTable::with_proc_path(self.proc())
    }

    pub(crate) fn fallback(&self, max_jobs: usize) -> FallbackResolver {
        FallbackResolver::new(self.table(), max_jobs)
            .passwd_path(self.passwd())
            .exclusions(&EbpfConfig::default())
    }

    pub(crate) fn resolver(
        &self,
        runner: Arc<ScriptedRunner>,
        enable_fallback: bool,
        ttl: Duration,
    ) -> JobResolver {
        let slurm = SlurmClient::new(runner, Duration::from_secs(1))
            .cgroup_root(self.cgroup())
            .process_table(self.table())
            .accounting_fields(vec!["JobID".to_string(), "State".to_string()]);
        JobResolver::new(
            Some(slurm),
            self.fallback(50),
            enable_fallback,
            TtlCache::new(ttl),
            StructuredLogger::new("node01"),
        )
    }
}
