//! Resolver tests against a scripted scheduler and a mock proc tree

use super::*;
use crate::collector::Aggregator;
use crate::models::{EventKind, JobInfo};
use crate::probes::DropCounters;
use crate::test_support::{MockHost, ScriptedRunner};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// alice runs a job (100 -> 101, with 102 daemonized under init), bob runs 200
fn populated_host() -> MockHost {
    let host = MockHost::new();
    host.process(1, 0, 0, "systemd", &[])
        .process(100, 1, 1001, "bash", &[("SLURM_JOB_ID", "4242")])
        .process(101, 100, 1001, "lammps", &[])
        .process(102, 1, 1001, "lammps-helper", &[])
        .process(200, 1, 1002, "python", &[("SLURM_JOB_ID", "4243")])
        .process(300, 1, 65534, "nobody-daemon", &[])
        .process_with(2, 0, 0, "kthreadd", &[], 'S', 0x200040)
        .process_with(400, 2, 1001, "kworker/0:1", &[], 'I', 0x4208060);
    host
}

fn unavailable_scheduler() -> Arc<ScriptedRunner> {
    Arc::new(ScriptedRunner::default())
}

fn working_scheduler() -> Arc<ScriptedRunner> {
    Arc::new(
        ScriptedRunner::default()
            .on("squeue --version", Ok("slurm 23.02.6"))
            .on("sstat --job 4242", Ok("4242.batch|101\n4242.0|102\n"))
            .on("sacct --job 4242", Ok("4242|COMPLETED\n"))
            .on(
                "--job 4242",
                Ok("4242|lammps|alice|compute|RUNNING|node[01-02]\n"),
            )
            .on(
                "--states=RUNNING",
                Ok("4242|lammps|alice|compute|RUNNING|node01\n"),
            ),
    )
}

#[tokio::test]
async fn test_fallback_when_scheduler_unavailable_for_every_query() {
    let host = populated_host();
    let runner = unavailable_scheduler();
    let resolver = host.resolver(runner, true, Duration::from_secs(30));

    let alice_pids: BTreeSet<u32> = [100, 101, 102].into_iter().collect();
    for target in [
        MonitorTarget::User("alice".to_string()),
        MonitorTarget::Job("4242".to_string()),
    ] {
        let resolution = resolver.resolve(&target).await;
        assert!(resolution.used_fallback(), "{target}");
        assert!(resolution.complete, "{target}");
        assert_eq!(resolution.jobs.len(), 1);
        let job = &resolution.jobs[0];
        assert_eq!(job.source, JobSource::Fallback);
        assert!(!job.pids.is_empty());
        assert!(job.pids.is_subset(&alice_pids), "{target}: {:?}", job.pids);
    }
}

#[tokio::test]
async fn test_fallback_user_includes_daemonized_but_not_kernel_threads() {
    let host = populated_host();
    let job = host.fallback(50).for_user("alice").unwrap();

    assert_eq!(job.pids.into_iter().collect::<Vec<_>>(), vec![100, 101, 102]);
    assert_eq!(job.info.job_id, "fallback-alice");
    assert_eq!(job.info.nodes, vec!["node01"]);
    assert_eq!(job.info.partition, "fallback");
}

#[tokio::test]
async fn test_fallback_job_follows_environment_and_descendants() {
    let host = populated_host();
    let job = host.fallback(50).for_job("4242").unwrap();
    assert_eq!(job.pids.into_iter().collect::<Vec<_>>(), vec![100, 101]);
    assert_eq!(job.info.user, "alice");

    assert!(matches!(
        host.fallback(50).for_job("9999"),
        Err(ResolveError::NoProcesses(_))
    ));
}

#[tokio::test]
async fn test_fallback_all_skips_system_accounts_and_caps() {
    let host = populated_host();
    let jobs = host.fallback(50).all().unwrap();
    let users: Vec<&str> = jobs.iter().map(|j| j.info.user.as_str()).collect();
    assert_eq!(users, vec!["alice", "bob"]);

    assert_eq!(host.fallback(1).all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fallback_unknown_user() {
    let host = populated_host();
    assert_eq!(
        host.fallback(50).for_user("mallory").unwrap_err(),
        ResolveError::UnknownUser("mallory".to_string())
    );
}

#[tokio::test]
async fn test_scheduler_backed_resolution() {
    let host = populated_host();
    let resolver = host.resolver(working_scheduler(), true, Duration::from_secs(30));

    let resolution = resolver.resolve(&MonitorTarget::Job("4242".to_string())).await;
    assert!(resolution.complete);
    assert!(!resolution.used_fallback());
    let job = &resolution.jobs[0];
    assert_eq!(job.source, JobSource::Scheduler);
    assert_eq!(job.info.nodes, vec!["node01", "node02"]);
    assert_eq!(job.pids.iter().copied().collect::<Vec<_>>(), vec![101, 102]);

    let acct = resolver.accounting("4242").await.unwrap();
    assert_eq!(acct["State"], "COMPLETED");
}

#[tokio::test]
async fn test_failing_query_degrades_only_that_query() {
    let host = populated_host();
    let runner = Arc::new(
        ScriptedRunner::default()
            .on("squeue --version", Ok("slurm 23.02.6"))
            .on(
                "--job 4243",
                Err(CommandError::Timeout {
                    command: "squeue".to_string(),
                    timeout: Duration::from_secs(1),
                }),
            )
            .on("--states=RUNNING", Ok("4242|lammps|alice|compute|RUNNING|node01\n"))
            .on("sstat --job 4242", Ok("4242.batch|101\n")),
    );
    let resolver = host.resolver(runner, true, Duration::from_secs(30));

    let degraded = resolver.resolve(&MonitorTarget::Job("4243".to_string())).await;
    assert!(degraded.used_fallback());
    assert_eq!(degraded.jobs[0].pids.iter().copied().collect::<Vec<_>>(), vec![200]);

    let healthy = resolver.resolve(&MonitorTarget::All).await;
    assert!(!healthy.used_fallback());
    assert_eq!(healthy.jobs[0].info.job_id, "4242");
}

#[tokio::test]
async fn test_fallback_after_one_failed_query_is_not_authoritative() {
    let host = populated_host();
    let runner = Arc::new(
        ScriptedRunner::default()
            .on("squeue --version", Ok("slurm 23.02.6"))
            .on("--user alice", Ok("4242|lammps|alice|compute|RUNNING|node01\n"))
            .on("sstat --job 4242", Ok("4242.batch|101\n"))
            .fail_call(
                "--user alice",
                2,
                CommandError::Timeout {
                    command: "squeue".to_string(),
                    timeout: Duration::from_secs(1),
                },
            ),
    );
    let resolver = host.resolver(runner, true, Duration::ZERO);
    let target = MonitorTarget::User("alice".to_string());

    let first = resolver.resolve(&target).await;
    assert!(first.complete);
    assert!(!first.used_fallback());

    let degraded = resolver.resolve(&target).await;
    assert!(degraded.used_fallback());
    assert!(!degraded.complete);

    let recovered = resolver.resolve(&target).await;
    assert!(recovered.complete);
    assert_eq!(recovered.jobs[0].info.job_id, "4242");
}

#[tokio::test]
async fn test_fallback_disabled_records_error() {
    let host = populated_host();
    let resolver = host.resolver(unavailable_scheduler(), false, Duration::from_secs(30));

    let resolution = resolver.resolve(&MonitorTarget::User("alice".to_string())).await;
    assert!(resolution.jobs.is_empty());
    assert!(!resolution.complete);
    assert_eq!(resolution.errors.len(), 1);
    assert_eq!(resolution.errors[0].target, "user:alice");
}

#[tokio::test]
async fn test_cached_results_skip_the_scheduler() {
    let host = populated_host();
    let runner = working_scheduler();
    let resolver = host.resolver(runner.clone(), true, Duration::from_secs(30));
    let target = MonitorTarget::Job("4242".to_string());

    resolver.resolve(&target).await;
    let calls = runner.calls();
    resolver.resolve(&target).await;
    assert_eq!(runner.calls(), calls);
}

#[tokio::test]
async fn test_expired_cache_refreshes_on_read() {
    let host = populated_host();
    let runner = working_scheduler();
    let resolver = host.resolver(runner.clone(), true, Duration::ZERO);
    let target = MonitorTarget::Job("4242".to_string());

    resolver.resolve(&target).await;
    let calls = runner.calls();
    resolver.resolve(&target).await;
    assert!(runner.calls() > calls);
}

#[tokio::test]
async fn test_cgroup_lookup_when_sstat_is_empty() {
    let host = populated_host();
    let step = host
        .cgroup()
        .join("system.slice/slurmstepd.scope/job_4242/step_0/user/task_0");
    std::fs::create_dir_all(&step).unwrap();
    std::fs::write(step.join("cgroup.procs"), "101\n102\n").unwrap();

    let runner = Arc::new(ScriptedRunner::default().on("sstat", Ok("")));
    let slurm = SlurmClient::new(runner, Duration::from_secs(1))
        .cgroup_root(host.cgroup())
        .process_table(host.table());

    let pids = slurm.job_pids("4242").await;
    assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![101, 102]);

    // Unknown to sstat and cgroups: environment scan
    let pids = slurm.job_pids("4243").await;
    assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![200]);
}

#[tokio::test]
async fn test_refresh_task_publishes() {
    let host = populated_host();
    let resolver = Arc::new(host.resolver(
        working_scheduler(),
        true,
        Duration::from_millis(20),
    ));
    let cancel = CancellationToken::new();
    let (mut rx, handle) =
        resolver.spawn_refresh(MonitorTarget::All, Resolution::empty(), cancel.clone());

    assert!(rx.borrow().jobs.is_empty());
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rx.borrow().jobs.len(), 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_resolution() {
    let host = populated_host();
    // The probe and the first query answer at once, every later call hangs
    let runner = Arc::new(
        ScriptedRunner::default()
            .on("squeue --version", Ok("slurm 23.02.6"))
            .on("--states=RUNNING", Ok("4242|lammps|alice|compute|RUNNING|node01\n"))
            .on("sstat --job 4242", Ok("4242.batch|101\n"))
            .slow_after(3, Duration::from_secs(30)),
    );
    let resolver = Arc::new(host.resolver(runner, true, Duration::from_millis(20)));
    let initial = resolver.resolve(&MonitorTarget::All).await;
    assert_eq!(initial.jobs.len(), 1);

    let cancel = CancellationToken::new();
    let (rx, handle) = resolver.spawn_refresh(MonitorTarget::All, initial, cancel.clone());
    tokio::time::sleep(Duration::from_millis(60)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_millis(500), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rx.borrow().jobs[0].info.job_id, "4242");
}

#[test]
fn test_target_parsing() {
    assert_eq!("all".parse::<MonitorTarget>().unwrap(), MonitorTarget::All);
    assert_eq!(
        "job:4242".parse::<MonitorTarget>().unwrap(),
        MonitorTarget::Job("4242".to_string())
    );
    assert_eq!(
        "user:alice".parse::<MonitorTarget>().unwrap().to_string(),
        "user:alice"
    );
    assert!("node:1".parse::<MonitorTarget>().is_err());
    assert!("job:".parse::<MonitorTarget>().is_err());
}

mod job_book {
    use super::*;

    fn resolved(job_id: &str, pids: &[u32]) -> ResolvedJob {
        ResolvedJob {
            info: JobInfo {
                job_id: job_id.to_string(),
                user: "alice".to_string(),
                job_name: "sim".to_string(),
                partition: "compute".to_string(),
                nodes: vec!["node01".to_string()],
                state: "RUNNING".to_string(),
            },
            source: JobSource::Scheduler,
            pids: pids.iter().copied().collect(),
        }
    }

    fn aggregator_with(pids: &[u32]) -> Aggregator {
        let aggregator = Aggregator::new(64, Arc::new(DropCounters::new()));
        for pid in pids {
            aggregator.ingest(
                &crate::models::Event {
                    timestamp_ns: 1,
                    pid: *pid,
                    tgid: *pid,
                    kind: EventKind::Sched {
                        run_ns: 100,
                        wait_ns: 0,
                        switches: 1,
                    },
                },
                None,
            );
        }
        aggregator
    }

    fn members(book: &JobBook, job_id: &str) -> Vec<u32> {
        book.get(job_id).unwrap().pid_set.iter().copied().collect()
    }

    #[test]
    fn test_union_with_previous_members() {
        let aggregator = aggregator_with(&[]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10, 11])], true, |_| true, &aggregator);
        // The scheduler momentarily forgets 11; it is still alive
        book.reconcile(&[resolved("1", &[10, 12])], true, |_| true, &aggregator);
        assert_eq!(members(&book, "1"), vec![10, 11, 12]);
    }

    #[test]
    fn test_exited_members_leave_pid_set_but_keep_counting() {
        let aggregator = aggregator_with(&[10, 11]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10, 11])], true, |_| true, &aggregator);
        book.reconcile(&[resolved("1", &[10, 11])], true, |pid| pid != 11, &aggregator);
        book.refresh_metrics(&aggregator);

        let job = book.get("1").unwrap();
        assert_eq!(members(&book, "1"), vec![10]);
        assert!(job.exited_pids.contains(&11));
        assert_eq!(job.aggregated_metrics.cpu_time_ns, 200);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let aggregator = aggregator_with(&[]);
        let mut book = JobBook::new();
        let input = [resolved("1", &[10, 11]), resolved("2", &[20])];
        book.reconcile(&input, true, |_| true, &aggregator);
        let first: Vec<(String, Vec<u32>)> = book
            .jobs()
            .map(|j| (j.job_id().to_string(), j.pid_set.iter().copied().collect()))
            .collect();
        book.reconcile(&input, true, |_| true, &aggregator);
        let second: Vec<(String, Vec<u32>)> = book
            .jobs()
            .map(|j| (j.job_id().to_string(), j.pid_set.iter().copied().collect()))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pid_has_single_owner() {
        let aggregator = aggregator_with(&[]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("b", &[10])], true, |_| true, &aggregator);
        book.reconcile(
            &[resolved("a", &[10, 11]), resolved("b", &[10])],
            true,
            |_| true,
            &aggregator,
        );
        assert_eq!(book.owner_of(10), Some("b"));
        assert_eq!(members(&book, "a"), vec![11]);

        // New contested PID goes to the lowest job id
        let mut fresh = JobBook::new();
        fresh.reconcile(
            &[resolved("y", &[30]), resolved("x", &[30])],
            true,
            |_| true,
            &aggregator,
        );
        assert_eq!(fresh.owner_of(30), Some("x"));
    }

    #[test]
    fn test_finalize_freezes_and_reclaims() {
        let aggregator = aggregator_with(&[10, 11]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10, 11])], true, |_| true, &aggregator);

        let outcome = book.reconcile(&[], true, |pid| pid != 11, &aggregator);
        assert_eq!(outcome.finalized, vec!["1".to_string()]);
        let job = book.get("1").unwrap();
        assert!(job.finalized);
        assert_eq!(job.aggregated_metrics.cpu_time_ns, 200);
        assert!(job.pid_set.is_empty());
        assert_eq!(job.released_pids.iter().copied().collect::<Vec<_>>(), vec![10]);
        assert_eq!(book.owner_of(10), None);

        // Later ingestion does not change frozen metrics
        book.refresh_metrics(&aggregator_with(&[10, 10, 10]));
        assert_eq!(book.get("1").unwrap().aggregated_metrics.cpu_time_ns, 200);

        assert_eq!(book.reclaim_exited(&aggregator), 1);
        assert!(aggregator.get(11).is_none());
        assert!(aggregator.get(10).is_some());
        assert_eq!(book.reclaim_exited(&aggregator), 0);
    }

    #[test]
    fn test_incomplete_resolution_never_finalizes() {
        let aggregator = aggregator_with(&[]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10])], true, |_| true, &aggregator);
        assert!(book
            .reconcile(&[], false, |_| true, &aggregator)
            .finalized
            .is_empty());
        assert!(!book.get("1").unwrap().finalized);
    }

    #[test]
    fn test_released_pid_joins_another_job_without_double_counting() {
        let aggregator = aggregator_with(&[10, 11]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10, 11])], true, |_| true, &aggregator);
        book.reconcile(&[], true, |_| true, &aggregator);
        assert_eq!(book.get("1").unwrap().aggregated_metrics.cpu_time_ns, 200);

        book.reconcile(&[resolved("2", &[10])], true, |_| true, &aggregator);
        book.refresh_metrics(&aggregator);
        assert_eq!(book.owner_of(10), Some("2"));
        assert_eq!(members(&book, "2"), vec![10]);
        assert_eq!(book.get("2").unwrap().aggregated_metrics.cpu_time_ns, 0);
        assert_eq!(book.get("1").unwrap().aggregated_metrics.cpu_time_ns, 200);

        let in_two_jobs = book
            .jobs()
            .filter(|j| j.pid_set.contains(&10))
            .count();
        assert_eq!(in_two_jobs, 1);
    }

    #[test]
    fn test_finalized_job_reopens_when_it_has_live_processes_again() {
        let aggregator = aggregator_with(&[10, 20]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("fallback-alice", &[10])], true, |_| true, &aggregator);
        // Every process of the user is gone
        let outcome = book.reconcile(&[], true, |pid| pid != 10, &aggregator);
        assert_eq!(outcome.finalized, vec!["fallback-alice".to_string()]);
        assert_eq!(book.reclaim_exited(&aggregator), 1);

        // New processes after the lull
        let outcome = book.reconcile(
            &[resolved("fallback-alice", &[20])],
            true,
            |pid| pid != 10,
            &aggregator,
        );
        assert_eq!(outcome.reopened, vec!["fallback-alice".to_string()]);
        book.refresh_metrics(&aggregator);

        let job = book.get("fallback-alice").unwrap();
        assert!(!job.finalized);
        assert_eq!(members(&book, "fallback-alice"), vec![20]);
        assert!(job.exited_pids.contains(&10));
        assert_eq!(job.aggregated_metrics.cpu_time_ns, 200);
    }

    #[test]
    fn test_finalized_job_with_no_claimable_process_stays_final() {
        let aggregator = aggregator_with(&[]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10])], true, |_| true, &aggregator);
        book.reconcile(&[resolved("2", &[10])], true, |_| true, &aggregator);
        book.reconcile(&[resolved("2", &[10])], true, |_| true, &aggregator);
        assert!(book.get("1").unwrap().finalized);

        // 1 lists 10 again, but 2 owns it
        let outcome = book.reconcile(
            &[resolved("1", &[10]), resolved("2", &[10])],
            true,
            |_| true,
            &aggregator,
        );
        assert!(outcome.reopened.is_empty());
        assert!(book.get("1").unwrap().finalized);
    }

    #[test]
    fn test_recycled_pid_starts_fresh_under_its_new_job() {
        let aggregator = aggregator_with(&[10]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10, 11])], true, |_| true, &aggregator);
        book.reconcile(&[resolved("1", &[11])], true, |pid| pid != 10, &aggregator);
        assert_eq!(book.owner_of(10), None);
        assert!(book.get("1").unwrap().exited_pids.contains(&10));

        // The number comes back as an unrelated process of job 2
        book.reconcile(
            &[resolved("1", &[11]), resolved("2", &[10])],
            true,
            |_| true,
            &aggregator,
        );
        assert_eq!(book.owner_of(10), Some("2"));
        assert!(aggregator.get(10).is_none());

        aggregator.ingest(
            &crate::models::Event {
                timestamp_ns: 2,
                pid: 10,
                tgid: 10,
                kind: EventKind::Sched {
                    run_ns: 40,
                    wait_ns: 0,
                    switches: 1,
                },
            },
            None,
        );
        book.refresh_metrics(&aggregator);
        assert_eq!(book.get("1").unwrap().aggregated_metrics.cpu_time_ns, 100);
        assert_eq!(book.get("2").unwrap().aggregated_metrics.cpu_time_ns, 40);
    }

    #[test]
    fn test_recycled_pid_rejoins_same_job_when_listed() {
        let aggregator = aggregator_with(&[10]);
        let mut book = JobBook::new();
        book.reconcile(&[resolved("1", &[10])], true, |_| true, &aggregator);
        book.reconcile(&[resolved("1", &[])], true, |_| false, &aggregator);
        assert!(members(&book, "1").is_empty());

        // Still-listed stale PID that is dead stays out
        book.reconcile(&[resolved("1", &[10])], true, |_| false, &aggregator);
        assert!(members(&book, "1").is_empty());

        book.reconcile(&[resolved("1", &[10])], true, |_| true, &aggregator);
        book.refresh_metrics(&aggregator);
        let job = book.get("1").unwrap();
        assert_eq!(members(&book, "1"), vec![10]);
        assert!(!job.exited_pids.contains(&10));
        // Counted once: frozen at exit, bucket reset on rejoin
        assert_eq!(job.aggregated_metrics.cpu_time_ns, 100);
    }

    #[test]
    fn test_alive_check_against_proc_tree() {
        let host = populated_host();
        let table = host.table();
        assert!(table.is_alive(101));
        host.exit(101);
        assert!(!table.is_alive(101));
        assert!(!Path::new(&host.proc().join("101")).exists());
    }
}
