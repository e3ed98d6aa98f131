// Integration tests for ParallelCoordinator with a shared CredentialPool
// Covers credential rotation, rate-limit backoff, isolation and checkpointing

#[cfg(test)]
mod parallel_integration_tests {
    use anyhow::bail;
    use ralph_batch_lib::credentials::{Credential, CredentialPool, ManualClock};
    use ralph_batch_lib::output::{CapturedOutput, OutputSink};
    use ralph_batch_lib::parallel::{
        CoordinatorError, CredentialPolicy, ParallelCoordinator, ProgressStats,
        ReservationPolicy, CREDENTIAL_UNAVAILABLE,
    };
    use ralph_batch_lib::shutdown::ShutdownState;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn coordinator(workers: usize) -> (ParallelCoordinator, CapturedOutput) {
        let (sink, captured) = OutputSink::capture();
        let coordinator = ParallelCoordinator::new(workers)
            .unwrap()
            .with_output(sink)
            .with_signal_handlers(false);
        (coordinator, captured)
    }

    fn retry(attempts: u32, delay_ms: u64) -> ReservationPolicy {
        ReservationPolicy {
            max_attempts: attempts,
            retry_delay: Duration::from_millis(delay_ms),
            on_exhausted: CredentialPolicy::Fail,
        }
    }

    #[test]
    fn test_two_credentials_five_items_three_workers() {
        let pool = Arc::new(CredentialPool::new(vec!["K1", "K2"]).unwrap());
        let (coordinator, _) = coordinator(3);
        let mut coordinator = coordinator
            .with_credentials(pool.clone())
            .with_reservation(retry(500, 2));

        let items: Vec<String> = (1..=5).map(|n| format!("issue-{}", n)).collect();
        let in_use = Mutex::new(HashSet::new());
        let max_concurrent = AtomicUsize::new(0);

        let report = coordinator.execute(
            &items,
            |id| id.clone(),
            |_, ctx| {
                let credential = ctx.credential().cloned().expect("credential reserved");
                {
                    let mut held = in_use.lock().unwrap();
                    assert!(held.insert(credential.clone()), "credential held twice");
                    max_concurrent.fetch_max(held.len(), Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(10));
                in_use.lock().unwrap().remove(&credential);
                Ok(())
            },
            false,
        );

        assert_eq!(
            report.stats,
            ProgressStats {
                total: 5,
                completed: 5,
                failed: 0
            }
        );
        assert_eq!(report.results.len(), 5);
        assert!(report.checkpoints.is_empty());
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);

        let status = pool.status();
        assert_eq!(status.available, 2);
        assert_eq!(status.reserved, 0);
        assert_eq!(status.rate_limited, 0);
    }

    #[test]
    fn test_rate_limited_single_credential() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(
            CredentialPool::with_clock(vec!["K1"], Duration::from_secs(60), clock.clone())
                .unwrap(),
        );
        let (coordinator, _) = coordinator(1);
        let mut coordinator = coordinator
            .with_credentials(pool.clone())
            .with_reservation(retry(3, 1));

        let items = vec!["issue-1", "issue-2"];
        let report = coordinator.execute(
            &items,
            |id| id.to_string(),
            |id, ctx| {
                if *id == "issue-1" {
                    ctx.mark_rate_limited()?;
                    bail!("HTTP 429 Too Many Requests");
                }
                Ok(())
            },
            false,
        );

        assert_eq!(report.stats.failed, 2);
        let second = report
            .results
            .iter()
            .find(|r| r.item_id == "issue-2")
            .unwrap();
        assert_eq!(second.error.as_deref(), Some(CREDENTIAL_UNAVAILABLE));

        let status = pool.status();
        assert_eq!(status.rate_limited, 1);
        assert_eq!(status.available, 0);

        // After the backoff window the credential is usable again
        clock.advance(Duration::from_secs(61));
        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.reserve(), Some(Credential::new("K1")));
    }

    #[test]
    fn test_worker_marks_credential_and_succeeds() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(
            CredentialPool::with_clock(vec!["K1"], Duration::from_secs(60), clock.clone())
                .unwrap(),
        );
        let (coordinator, _) = coordinator(1);
        let mut coordinator = coordinator
            .with_credentials(pool.clone())
            .with_reservation(retry(3, 1));

        let report = coordinator.execute(
            &["issue-1", "issue-2"],
            |id| id.to_string(),
            |id, ctx| {
                if *id == "issue-1" {
                    ctx.mark_rate_limited()?;
                }
                Ok(())
            },
            false,
        );

        let error_of = |id: &str| {
            report
                .results
                .iter()
                .find(|r| r.item_id == id)
                .map(|r| (r.succeeded, r.error.clone()))
                .unwrap()
        };
        assert_eq!(error_of("issue-1"), (true, None));
        assert_eq!(
            error_of("issue-2"),
            (false, Some(CREDENTIAL_UNAVAILABLE.to_string()))
        );
        assert_eq!(
            report.stats,
            ProgressStats {
                total: 2,
                completed: 2,
                failed: 1
            }
        );

        let status = pool.status();
        assert_eq!(status.rate_limited, 1);
        assert_eq!(status.reserved, 0);

        clock.advance(Duration::from_secs(61));
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_failures_do_not_affect_other_items() {
        let pool = Arc::new(CredentialPool::new(vec!["K1", "K2", "K3"]).unwrap());
        let (coordinator, _) = coordinator(3);
        let mut coordinator = coordinator
            .with_credentials(pool.clone())
            .with_reservation(retry(500, 2));

        let items: Vec<u32> = (1..=9).collect();
        let report = coordinator.execute(
            &items,
            |n| format!("item-{}", n),
            |n, _| match n % 3 {
                0 => bail!("item {} failed", n),
                1 => panic!("item {} panicked", n),
                _ => Ok(()),
            },
            false,
        );

        assert_eq!(report.stats.completed, 9);
        assert_eq!(report.stats.failed, 6);
        assert_eq!(report.stats.succeeded(), 3);
        assert!(report
            .failed_results()
            .any(|r| r.error.as_deref() == Some("worker panicked: item 4 panicked")));
        assert!(report
            .failed_results()
            .any(|r| r.error.as_deref() == Some("item 3 failed")));

        // Every reservation was released, including the panicking ones
        assert_eq!(pool.status().available, 3);
    }

    #[test]
    fn test_shutdown_request_checkpoints_remaining_items() {
        let shutdown = ShutdownState::new();
        let (coordinator, captured) = coordinator(1);
        let mut coordinator = coordinator.with_shutdown(shutdown.clone());

        let items: Vec<String> = (1..=6).map(|n| format!("issue-{}", n)).collect();
        let report = coordinator.execute(
            &items,
            |id| id.clone(),
            |id, _| {
                if id == "issue-3" {
                    shutdown.request_shutdown();
                }
                Ok(())
            },
            false,
        );

        assert!(report.interrupted);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.checkpoints, vec!["issue-4", "issue-5", "issue-6"]);
        assert_eq!(report.results.len() + report.checkpoints.len(), items.len());
        assert!(!report.is_clean());
        assert!(captured
            .contents()
            .contains("Not started: issue-4, issue-5, issue-6"));
    }

    #[test]
    fn test_checkpoint_completeness_with_many_workers() {
        let shutdown = ShutdownState::new();
        let (coordinator, _) = coordinator(4);
        let mut coordinator = coordinator.with_shutdown(shutdown.clone());

        let items: Vec<u32> = (0..50).collect();
        let report = coordinator.execute(
            &items,
            |n| format!("item-{}", n),
            |n, _| {
                if *n == 10 {
                    shutdown.request_shutdown();
                }
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            },
            false,
        );

        let attempted: HashSet<_> = report.results.iter().map(|r| r.item_id.clone()).collect();
        let checkpointed: HashSet<_> = report.checkpoints.iter().cloned().collect();
        assert!(attempted.is_disjoint(&checkpointed));
        assert_eq!(attempted.len() + checkpointed.len(), items.len());
        assert!(!checkpointed.is_empty());
    }

    #[test]
    fn test_run_without_credentials_when_exhausted() {
        let pool = Arc::new(CredentialPool::new(vec!["K1"]).unwrap());
        pool.mark_rate_limited(&Credential::new("K1")).unwrap();

        let (coordinator, _) = coordinator(2);
        let mut coordinator = coordinator
            .with_credentials(pool)
            .with_reservation(ReservationPolicy {
                on_exhausted: CredentialPolicy::RunWithout,
                ..retry(2, 1)
            });

        let without = AtomicUsize::new(0);
        let report = coordinator.execute(
            &["a", "b", "c"],
            |id| id.to_string(),
            |_, ctx| {
                if ctx.credential().is_none() {
                    without.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            },
            false,
        );

        assert!(report.is_clean());
        assert_eq!(without.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_worker_count_limits() {
        assert_eq!(ParallelCoordinator::new(11).unwrap().max_workers(), 10);
        assert_eq!(
            ParallelCoordinator::new(0).err(),
            Some(CoordinatorError::InvalidWorkerCount(0))
        );
    }

    #[test]
    fn test_dry_run_lists_items_in_order() {
        let pool = Arc::new(CredentialPool::new(vec!["K1"]).unwrap());
        let (coordinator, captured) = coordinator(3);
        let mut coordinator = coordinator.with_credentials(pool.clone());

        let report = coordinator.execute(
            &["issue-9", "issue-1", "issue-5"],
            |id| id.to_string(),
            |_, _| panic!("worker must not run"),
            true,
        );

        assert!(report.dry_run);
        assert_eq!(report.stats, ProgressStats::default());
        assert_eq!(
            captured.lines(),
            vec![
                "Dry run: 3 items would be executed",
                "  1. issue-9",
                "  2. issue-1",
                "  3. issue-5"
            ]
        );
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_unsafe_item_ids_never_reach_worker() {
        let (mut coordinator, _) = coordinator(2);
        let seen = Mutex::new(Vec::new());

        let items = vec!["../etc/passwd", "/abs", "C:evil", "bad id", "", "issue-7"];
        let report = coordinator.execute(
            &items,
            |id| id.to_string(),
            |id, _| {
                seen.lock().unwrap().push(id.to_string());
                Ok(())
            },
            false,
        );

        assert_eq!(*seen.lock().unwrap(), vec!["issue-7"]);
        assert_eq!(report.stats.failed, 5);
        assert!(report
            .failed_results()
            .all(|r| r.error.as_deref().unwrap_or("").starts_with("invalid item id")));
    }

    #[test]
    fn test_concurrent_output_lines_are_attributed() {
        let (mut coordinator, captured) = coordinator(4);
        let items: Vec<String> = (1..=8).map(|n| format!("issue-{}", n)).collect();

        coordinator.execute(
            &items,
            |id| id.clone(),
            |id, ctx| {
                for step in 0..20 {
                    ctx.print(&format!("{} step ", id));
                    ctx.print(&format!("{}\n", step));
                }
                Ok(())
            },
            false,
        );

        let worker_lines: Vec<String> = captured
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("[issue-"))
            .collect();
        assert_eq!(worker_lines.len(), 8 * 20);
        for line in worker_lines {
            let (prefix, body) = line.split_once(' ').unwrap();
            let id = prefix.trim_start_matches('[').trim_end_matches(']');
            assert!(body.starts_with(&format!("{} step ", id)), "mixed line: {}", line);
        }
    }
}
