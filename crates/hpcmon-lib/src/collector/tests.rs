//! Tests for the drain loop and aggregator
//!
//! Events go through the simulated tracer so the full
//! encode/poll/decode/filter/ingest path is exercised.

#[cfg(test)]
mod aggregator_tests {
    use crate::collector::Aggregator;
    use crate::models::{Event, EventKind, IoDirection, NetDirection, ProbeType};
    use crate::probes::DropCounters;
    use std::sync::Arc;

    fn event(ts: u64, tgid: u32, kind: EventKind) -> Event {
        Event {
            timestamp_ns: ts,
            pid: tgid,
            tgid,
            kind,
        }
    }

    fn workload() -> Vec<Event> {
        vec![
            event(10, 100, EventKind::Syscall { syscall_id: 0, duration_ns: 500 }),
            event(11, 100, EventKind::Syscall { syscall_id: 0, duration_ns: 1500 }),
            event(12, 100, EventKind::Syscall { syscall_id: 44, duration_ns: 70 }),
            event(13, 100, EventKind::Syscall { syscall_id: 202, duration_ns: 9 }),
            event(14, 100, EventKind::Sched { run_ns: 4000, wait_ns: 300, switches: 1 }),
            event(15, 100, EventKind::Sched { run_ns: 1000, wait_ns: 700, switches: 3 }),
            event(16, 100, EventKind::Io { direction: IoDirection::Read, bytes: 4096, ops: 1 }),
            event(17, 100, EventKind::Io { direction: IoDirection::Write, bytes: 512, ops: 2 }),
            event(18, 100, EventKind::Net { direction: NetDirection::Send, bytes: 64 }),
            event(19, 200, EventKind::Net { direction: NetDirection::Recv, bytes: 128 }),
            event(20, 200, EventKind::Syscall { syscall_id: 1, duration_ns: 33 }),
        ]
    }

    fn aggregate(events: &[Event]) -> Aggregator {
        let aggregator = Aggregator::new(1024, Arc::new(DropCounters::new()));
        for e in events {
            aggregator.ingest(e, Some("solver"));
        }
        aggregator
    }

    #[test]
    fn test_counters_by_category() {
        let aggregator = aggregate(&workload());
        let m = aggregator.get(100).unwrap();

        assert_eq!(m.syscalls_total, 4);
        assert_eq!(m.syscalls_by_name["read"], 2);
        assert_eq!(m.syscalls_by_name["sendto"], 1);
        assert_eq!(m.io_syscalls, 2);
        assert_eq!(m.io_syscall_time_ns, 2000);
        assert_eq!(m.net_syscalls, 1);
        assert_eq!(m.cpu_time_ns, 5000);
        assert_eq!(m.wait_time_ns, 1000);
        assert_eq!(m.context_switches, 4);
        assert_eq!(m.io_bytes_read, 4096);
        assert_eq!(m.io_bytes_write, 512);
        assert_eq!(m.io_ops, 3);
        assert_eq!(m.net_bytes_send, 64);
        assert_eq!(m.net_ops, 1);
        assert_eq!(m.syscall_duration.min_ns, 9);
        assert_eq!(m.syscall_duration.max_ns, 1500);
        assert_eq!(m.first_seen_ns, 10);
        assert_eq!(m.last_seen_ns, 18);
        assert_eq!(m.comm, "solver");
    }

    #[test]
    fn test_order_independence() {
        let forward = workload();
        let expected = aggregate(&forward).snapshot();

        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(aggregate(&reversed).snapshot(), expected);

        for shift in 1..forward.len() {
            let mut rotated = forward.clone();
            rotated.rotate_left(shift);
            assert_eq!(aggregate(&rotated).snapshot(), expected, "rotation {shift}");
        }
    }

    #[test]
    fn test_bucket_cap_counts_drops() {
        let drops = Arc::new(DropCounters::new());
        let aggregator = Aggregator::new(1, drops.clone());

        assert!(aggregator.ingest(&workload()[0], None));
        // Existing bucket still accepts events
        assert!(aggregator.ingest(&workload()[4], None));
        // New PID is rejected
        assert!(!aggregator.ingest(&workload()[9], None));

        assert_eq!(aggregator.len(), 1);
        assert_eq!(drops.get(ProbeType::Net).dropped, 1);
    }

    #[test]
    fn test_memory_limit_sizes_cap() {
        let aggregator = Aggregator::with_memory_limit(1, Arc::new(DropCounters::new()));
        assert_eq!(aggregator.max_buckets(), 256);
    }

    #[test]
    fn test_sum_reclaim_reset() {
        let aggregator = aggregate(&workload());
        let total = aggregator.sum([100, 200, 999]);
        assert_eq!(total.syscalls_total, 5);
        assert_eq!(total.net_ops, 2);

        assert_eq!(aggregator.reclaim([200, 999]), 1);
        assert_eq!(aggregator.pids(), vec![100]);

        aggregator.reset();
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_snapshot_during_concurrent_ingestion() {
        let aggregator = Arc::new(Aggregator::new(1024, Arc::new(DropCounters::new())));
        let writer = {
            let aggregator = aggregator.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    let e = event(i, (i % 8) as u32 + 1, EventKind::Sched {
                        run_ns: 1,
                        wait_ns: 0,
                        switches: 1,
                    });
                    aggregator.ingest(&e, None);
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let seen: u64 = aggregator.snapshot().values().map(|m| m.cpu_time_ns).sum();
            assert!(seen >= last);
            last = seen;
        }
        writer.join().unwrap();

        let total: u64 = aggregator.snapshot().values().map(|m| m.context_switches).sum();
        assert_eq!(total, 10_000);
    }
}

#[cfg(test)]
mod drain_tests {
    use crate::collector::{Aggregator, DrainConfig, DrainLoop, Sampler};
    use crate::config::EbpfConfig;
    use crate::models::{Event, EventKind, IoDirection, ProbeType};
    use crate::probes::{
        AttachError, DropCounters, EventFilter, KernelTracer, KernelVersion, PollBatch,
        ProbeHandle, ProbeSet, ProbeSpec, SimulatedTracer,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    /// Simulated tracer whose polls hold the calling thread, like a `/proc` scan
    struct SluggishTracer {
        inner: SimulatedTracer,
        delay: Duration,
    }

    impl KernelTracer for SluggishTracer {
        fn name(&self) -> &str {
            "sluggish"
        }

        fn kernel_version(&self) -> KernelVersion {
            self.inner.kernel_version()
        }

        fn attach(&self, spec: &ProbeSpec) -> Result<ProbeHandle, AttachError> {
            self.inner.attach(spec)
        }

        fn poll(&self, handle: &ProbeHandle, max_records: usize) -> PollBatch {
            std::thread::sleep(self.delay);
            self.inner.poll(handle, max_records)
        }

        fn detach(&self, handle: ProbeHandle) {
            self.inner.detach(handle)
        }

        fn attached_count(&self) -> usize {
            self.inner.attached_count()
        }
    }

    struct Harness {
        tracer: Arc<SimulatedTracer>,
        aggregator: Arc<Aggregator>,
        drops: Arc<DropCounters>,
        drain: DrainLoop,
    }

    fn harness(ebpf: EbpfConfig, config: DrainConfig) -> Harness {
        let tracer = Arc::new(SimulatedTracer::new(KernelVersion::new(6, 1, 0)));
        let drops = Arc::new(DropCounters::new());
        let aggregator = Arc::new(Aggregator::new(1024, drops.clone()));
        let filter = EventFilter::from_config(&ebpf);
        let probes = ProbeSet::attach(tracer.clone(), &ebpf, &filter);
        let drain = DrainLoop::new(probes, aggregator.clone(), filter, drops.clone(), config);
        Harness {
            tracer,
            aggregator,
            drops,
            drain,
        }
    }

    fn io_read(tgid: u32, bytes: u64) -> Event {
        Event {
            timestamp_ns: 1,
            pid: tgid,
            tgid,
            kind: EventKind::Io {
                direction: IoDirection::Read,
                bytes,
                ops: 1,
            },
        }
    }

    #[test]
    fn test_sampler_stride() {
        let mut sampler = Sampler::new(0.25);
        let kept = (0..100).filter(|_| sampler.keep(ProbeType::Io)).count();
        assert_eq!(kept, 25);

        let mut all = Sampler::new(1.0);
        assert!((0..10).all(|_| all.keep(ProbeType::Net)));
    }

    #[test]
    fn test_poll_cap_leaves_excess_queued() {
        let mut h = harness(
            EbpfConfig::default(),
            DrainConfig {
                max_events_per_poll: 3,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            h.tracer.emit(&io_read(300, 10), "solver");
        }

        assert_eq!(h.drain.poll_once(), 3);
        assert_eq!(h.tracer.pending(ProbeType::Io), 2);
        assert_eq!(h.drain.poll_once(), 2);
        assert_eq!(h.aggregator.get(300).unwrap().io_bytes_read, 50);
    }

    #[test]
    fn test_saturation_and_decode_errors_are_counted() {
        let mut h = harness(
            EbpfConfig {
                buffer_size: 2,
                ..Default::default()
            },
            DrainConfig::default(),
        );
        for _ in 0..4 {
            h.tracer.emit(&io_read(300, 10), "solver");
        }
        h.drain.poll_once();
        let after_first = h.drops.get(ProbeType::Io).dropped;
        assert_eq!(after_first, 2);

        h.tracer.emit_raw(ProbeType::Io, vec![0u8; 7]);
        h.drain.poll_once();
        let counts = h.drops.get(ProbeType::Io);
        assert_eq!(counts.decode_errors, 1);
        assert!(counts.dropped >= after_first);
    }

    #[test]
    fn test_excluded_processes_never_reach_aggregator() {
        let mut h = harness(EbpfConfig::default(), DrainConfig::default());
        h.tracer.emit(&io_read(5, 10), "kworker/1:2");
        h.tracer.emit(&io_read(6, 10), "solver");
        h.drain.poll_once();

        assert!(h.aggregator.get(5).is_none());
        assert!(h.aggregator.get(6).is_some());
        assert_eq!(h.drain.stats().filtered, 1);
    }

    #[tokio::test]
    async fn test_slow_polls_do_not_stall_other_tasks() {
        let tracer = Arc::new(SluggishTracer {
            inner: SimulatedTracer::new(KernelVersion::new(6, 1, 0)),
            delay: Duration::from_millis(100),
        });
        let ebpf = EbpfConfig::default();
        let drops = Arc::new(DropCounters::new());
        let filter = EventFilter::from_config(&ebpf);
        let probes = ProbeSet::attach(tracer.clone(), &ebpf, &filter);
        let drain = DrainLoop::new(
            probes,
            Arc::new(Aggregator::new(1024, drops.clone())),
            filter,
            drops,
            DrainConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain.run(cancel.clone()));
        tokio::task::yield_now().await;

        // One pass holds a thread for 400ms; this runtime thread stays free
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(start.elapsed() < Duration::from_millis(150));

        cancel.cancel();
        let (mut probes, _) = task.await.unwrap();
        probes.detach_all();
        assert_eq!(tracer.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_remaining_records_on_cancel() {
        let h = harness(
            EbpfConfig::default(),
            DrainConfig {
                poll_interval: Duration::from_secs(3600),
                max_events_per_poll: 2,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.drain.run(cancel.clone()));

        // Let the first immediate tick pass before queueing records
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..7 {
            h.tracer.emit(&io_read(300, 1), "solver");
        }
        cancel.cancel();

        let (mut probes, stats) = task.await.unwrap();
        assert_eq!(h.aggregator.get(300).unwrap().io_ops, 7);
        assert!(stats.iterations >= 4);

        probes.detach_all();
        assert_eq!(h.tracer.attached_count(), 0);
    }
}
