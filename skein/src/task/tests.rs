use crate as skein;
use crate::test_utils::Recorder;
use crate::{
    Builder, EmptyTask, Parallel, Series, State, TimeoutReason, count_by_name, create_counter_task,
    create_empty_task, create_go_task, create_parallel_work, create_pread_task, create_pwrite_task,
    create_timer_task, errors, series_of, start_parallel_work,
};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn mark(seen: &Recorder<&'static str>, label: &'static str) -> EmptyTask {
    let seen = seen.clone();
    let mut task = create_empty_task();
    task.set_callback(move |_| seen.record(label));
    task
}

fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("{prefix}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

#[skein::test(worker_threads = 2)]
fn test_series_runs_in_order() {
    let seen = Recorder::new();

    let series = Series::new(mark(&seen, "a"));
    series.push_back(mark(&seen, "b"));
    series.push_back(mark(&seen, "c"));

    let done = seen.clone();
    series.set_callback(move |series| {
        assert_eq!(series.task_seq(), 3);
        done.record("done");
    });
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["a", "b", "c", "done"]);
}

#[skein::test(worker_threads = 2)]
fn test_callback_extends_series() {
    let seen = Recorder::new();

    let first = create_timer_task(Duration::from_millis(5), {
        let seen = seen.clone();
        move |task| {
            seen.record("a");
            let series = series_of(task);
            series.push_back(mark(&seen, "b"));
            series.push_front(mark(&seen, "front"));
        }
    });

    let series = Series::new(first);
    let done = seen.clone();
    series.set_callback(move |_| done.record("done"));
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["a", "front", "b", "done"]);
}

#[skein::test(worker_threads = 2)]
fn test_cancel_dismisses_queued_work() {
    let seen = Recorder::new();

    let mut first = create_empty_task();
    {
        let seen = seen.clone();
        first.set_callback(move |task| {
            seen.record("a");
            series_of(task).cancel();
        });
    }

    let series = Series::new(first);
    series.push_back(mark(&seen, "never"));

    let done = seen.clone();
    series.set_callback(move |series| {
        assert!(series.is_canceled());
        done.record("done");
    });
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["a", "done"]);
}

#[skein::test(worker_threads = 4)]
fn test_parallel_callback_sees_members() {
    let seen = Recorder::new();

    let members: Vec<Series> = (0..3u64)
        .map(|i| {
            Series::new(create_timer_task(Duration::from_millis(30 - i * 10), move |task| {
                series_of(task).set_context(i * 100);
            }))
        })
        .collect();

    let recorder = seen.clone();
    let parallel = create_parallel_work(members, move |parallel| {
        let contexts: Vec<u64> = parallel
            .iter()
            .map(|member| member.take_context::<u64>().unwrap_or_default())
            .collect();
        recorder.record(format!("{contexts:?}"));
    });

    let series = Series::new(parallel);
    let done = seen.clone();
    series.push_back({
        let mut task = create_empty_task();
        task.set_callback(move |_| done.record("after".to_owned()));
        task
    });
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["[0, 100, 200]".to_owned(), "after".to_owned()]);
}

#[skein::test(worker_threads = 2)]
fn test_empty_parallel_completes() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    start_parallel_work(Vec::new(), move |parallel| recorder.record(parallel.size()));

    skein::wait_finish();
    assert_eq!(seen.take(), vec![0]);
}

#[skein::test(worker_threads = 2)]
fn test_nested_parallel_member_failures_stay_local() {
    let seen = Recorder::new();

    let failing = Series::new(create_go_task("boom", || -> u32 { panic!("boom") }, |_| {}));
    let fine = Series::new(create_go_task("fine", || 42u32, |_| {}));

    let mut inner = Parallel::new();
    inner.add_series(failing);
    inner.add_series(fine);

    let recorder = seen.clone();
    inner.set_callback(move |parallel| {
        let finished = parallel.iter().filter(|s| s.is_finished()).count();
        recorder.record(finished);
    });

    let mut outer = Parallel::new();
    outer.add_series(Series::new(inner));
    let recorder = seen.clone();
    outer.set_callback(move |parallel| recorder.record(parallel.size() * 10));
    outer.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![2, 10]);
}

#[skein::test(worker_threads = 2)]
fn test_series_context_persists() {
    let seen = Recorder::new();

    let first = create_timer_task(Duration::from_millis(1), |task| {
        series_of(task).set_context(vec!["first"]);
    });

    let series = Series::new(first);
    series.push_back(create_timer_task(Duration::from_millis(1), |task| {
        series_of(task).with_context(|ctx: &mut Vec<&'static str>| ctx.push("second"));
    }));

    let recorder = seen.clone();
    series.set_callback(move |series| {
        if let Some(ctx) = series.take_context::<Vec<&str>>() {
            recorder.record(ctx);
        }
    });
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![vec!["first", "second"]]);
}

#[skein::test(worker_threads = 2)]
fn test_wait_finish_is_idempotent() {
    skein::wait_finish();

    let seen = Recorder::new();
    let recorder = seen.clone();
    create_timer_task(Duration::from_millis(10), move |_| recorder.record(())).start();

    skein::wait_finish();
    skein::wait_finish();
    assert!(skein::wait_finish_timeout(Duration::ZERO));
    assert_eq!(seen.len(), 1);
}

#[skein::test(worker_threads = 2)]
fn test_wait_finish_timeout_expires() {
    create_timer_task(Duration::from_millis(200), |_| {}).start();
    assert!(!skein::wait_finish_timeout(Duration::from_millis(10)));
}

#[skein::test(worker_threads = 2)]
fn test_wait_finish_on_worker_panics() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    create_timer_task(Duration::ZERO, move |_| {
        let res = panic::catch_unwind(AssertUnwindSafe(skein::wait_finish));
        recorder.record(res.is_err());
    })
    .start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![true]);
}

#[skein::test(worker_threads = 2)]
fn test_timer_waits() {
    let seen = Recorder::new();
    let start = Instant::now();

    let recorder = seen.clone();
    create_timer_task(Duration::from_millis(30), move |task| {
        recorder.record((task.state(), start.elapsed() >= Duration::from_millis(30)));
    })
    .start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![(State::Success, true)]);
}

#[skein::test(worker_threads = 2)]
fn test_deadline_fails_with_wait_reason() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let mut task = create_timer_task(Duration::from_secs(10), move |task| {
        recorder.record((task.state(), task.error(), task.timeout_reason()));
    });
    task.set_deadline(Duration::from_millis(20));
    task.start();

    skein::wait_finish();
    assert_eq!(
        seen.take(),
        vec![(State::SysError, libc::ETIMEDOUT, TimeoutReason::Wait)]
    );
}

#[test]
fn test_shutdown_aborts_running_tasks() -> anyhow::Result<()> {
    let engine = Builder::new().worker_threads(1).try_build()?;
    let seen = Recorder::new();

    let recorder = seen.clone();
    let series = Series::new(create_timer_task(Duration::from_secs(60), move |task| {
        recorder.record(format!("{}:{}", task.state(), task.error() == libc::ECANCELED));
    }));
    series.push_back(mark_owned(&seen, "never"));

    let recorder = seen.clone();
    series.set_callback(move |_| recorder.record("done".to_owned()));
    engine.start_series(series);

    std::thread::sleep(Duration::from_millis(20));
    let handle = engine.handle().clone();
    engine.shutdown();

    assert_eq!(seen.take(), vec!["aborted:true".to_owned(), "done".to_owned()]);
    assert_eq!(handle.outstanding(), 0);
    Ok(())
}

fn mark_owned(seen: &Recorder<String>, label: &'static str) -> EmptyTask {
    let seen = seen.clone();
    let mut task = create_empty_task();
    task.set_callback(move |_| seen.record(label.to_owned()));
    task
}

#[test]
fn test_closed_engine_refuses_series() -> anyhow::Result<()> {
    let engine = Builder::new().worker_threads(1).try_build()?;
    let handle = engine.handle().clone();
    engine.shutdown();

    let seen = Recorder::new();
    let series = Series::new(mark(&seen, "never"));
    let recorder = seen.clone();
    series.set_callback(move |_| recorder.record("done"));
    handle.start_series(series);

    assert!(handle.is_closed());
    assert_eq!(handle.outstanding(), 0);
    assert!(seen.take().is_empty());
    Ok(())
}

#[skein::test(worker_threads = 2, compute_threads = 2)]
fn test_go_task_returns_value() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    create_go_task("sum", || (1..=10u32).sum::<u32>(), move |task| {
        recorder.record((task.name().to_owned(), task.state(), task.take_resp()));
    })
    .start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![("sum".to_owned(), State::Success, Some(55))]);
}

#[skein::test(worker_threads = 2)]
fn test_go_task_panic() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    create_go_task("oops", || -> u8 { panic!("oops") }, move |task| {
        recorder.record((task.state(), task.error()));
    })
    .start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![(State::TaskError, errors::GO_PANICKED)]);
}

#[skein::test(worker_threads = 2)]
fn test_pwrite_then_pread() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(b"0123456789")?;
    let path = file.path().to_path_buf();

    let seen = Recorder::new();
    let recorder = seen.clone();
    let write = create_pwrite_task(path.as_path(), b"abc".to_vec(), 4, move |task| {
        recorder.record((task.state(), task.resp().to_string()));
    });

    let recorder = seen.clone();
    let read = create_pread_task(path.as_path(), 64, 2, move |task| {
        let data = String::from_utf8_lossy(task.resp()).into_owned();
        recorder.record((task.state(), data));
    });

    let series = Series::new(write);
    series.push_back(read);
    series.start();

    skein::wait_finish();
    assert_eq!(
        seen.take(),
        vec![
            (State::Success, "3".to_owned()),
            (State::Success, "23abc789".to_owned()),
        ]
    );
    Ok(())
}

#[skein::test(worker_threads = 2)]
fn test_pread_missing_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("missing");

    let seen = Recorder::new();
    let recorder = seen.clone();
    create_pread_task(path, 16, 0, move |task| {
        recorder.record((task.state(), task.error()));
    })
    .start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![(State::SysError, libc::ENOENT)]);
    Ok(())
}

#[skein::test(worker_threads = 2)]
fn test_counter_by_name() {
    let name = unique_name("counter");
    let seen = Recorder::new();

    let recorder = seen.clone();
    create_counter_task(Some(&name), 2, move |task| recorder.record(task.state())).start();

    count_by_name(&name, 1);
    assert!(!skein::wait_finish_timeout(Duration::from_millis(20)));

    count_by_name(&name, 5);
    skein::wait_finish();
    assert_eq!(seen.take(), vec![State::Success]);
}

#[skein::test(worker_threads = 2)]
fn test_counter_handle() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let task = create_counter_task(None, 1, move |task| recorder.record(task.state()));
    let counter = task.counter();
    task.start();

    counter.count();
    skein::wait_finish();
    assert_eq!(seen.take(), vec![State::Success]);
}

#[skein::test(worker_threads = 2)]
fn test_user_data_reaches_callback() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let mut task = create_timer_task(Duration::ZERO, move |task| {
        recorder.record(task.take_user_data::<Arc<str>>());
    });
    task.set_user_data(Arc::<str>::from("payload"));
    task.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![Some(Arc::<str>::from("payload"))]);
}

#[test]
#[should_panic]
fn test_series_of_idle_task_panics() {
    let task = create_empty_task();
    let _ = series_of(&task);
}

#[skein::test(worker_threads = 2)]
fn test_unreachable_host_exhausts_retries() -> anyhow::Result<()> {
    let seen = Recorder::new();

    let recorder = seen.clone();
    crate::create_http_task("http://127.0.0.1:1/", 0, 2, move |task| {
        recorder.record((task.state(), task.retry_count()));
    })?
    .start();

    skein::wait_finish();
    let outcome = seen.take();
    assert_eq!(outcome.len(), 1);
    assert_ne!(outcome[0].0, State::Success);
    assert_eq!(outcome[0].1, 2);
    Ok(())
}

#[skein::test(worker_threads = 2)]
fn test_pushed_task_runs_before_series_callback() {
    let seen = Recorder::new();

    let mut t1 = create_empty_task();
    {
        let seen = seen.clone();
        t1.set_callback(move |task| {
            seen.record("T1");
            series_of(task).push_back(mark(&seen, "T2"));
        });
    }

    let series = Series::new(t1);
    let done = seen.clone();
    series.set_callback(move |_| done.record("series"));
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["T1", "T2", "series"]);
}

#[skein::test(worker_threads = 4)]
fn test_parallel_with_failing_member() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let seen = Recorder::new();

    let ok = |i: usize| {
        Series::new(create_timer_task(Duration::from_millis(5), move |task| {
            series_of(task).set_context((i, task.state()));
        }))
    };
    let failing = Series::new(create_pread_task(dir.path().join("missing"), 8, 0, |task| {
        series_of(task).set_context((1usize, task.state()));
    }));

    let recorder = seen.clone();
    start_parallel_work(vec![ok(0), failing, ok(2)], move |parallel| {
        let members: Vec<_> = (0..parallel.size())
            .filter_map(|i| parallel.series_at(i)?.take_context::<(usize, State)>())
            .collect();
        recorder.record(members);
    });

    skein::wait_finish();
    assert_eq!(
        seen.take(),
        vec![vec![(0, State::Success), (1, State::SysError), (2, State::Success)]]
    );
    Ok(())
}

#[skein::test(worker_threads = 2)]
fn test_expired_deadline_keeps_series_draining() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let mut slow = create_timer_task(Duration::from_secs(10), move |task| {
        recorder.record(format!("{}:{:?}", task.state(), task.timeout_reason()));
        series_of(task).push_back(mark_owned(&recorder, "pushed"));
    });
    slow.set_deadline(Duration::from_millis(20));

    let series = Series::new(slow);
    series.push_back(mark_owned(&seen, "queued"));
    let done = seen.clone();
    series.set_callback(move |_| done.record("series".to_owned()));
    series.start();

    skein::wait_finish();
    assert_eq!(
        seen.take(),
        vec![
            "system error:Wait".to_owned(),
            "queued".to_owned(),
            "pushed".to_owned(),
            "series".to_owned(),
        ]
    );
}

#[skein::test(worker_threads = 2)]
fn test_unrepresentable_deadline_means_none() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let mut task = create_timer_task(Duration::from_millis(10), move |task| {
        recorder.record((task.state(), task.timeout_reason()));
    });
    task.set_deadline(Duration::MAX);
    task.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec![(State::Success, TimeoutReason::NotTimeout)]);
}

#[skein::test(worker_threads = 2)]
fn test_endless_timer_still_honors_deadline() {
    let seen = Recorder::new();

    let recorder = seen.clone();
    let mut task = create_timer_task(Duration::MAX, move |task| {
        recorder.record((task.state(), task.error(), task.timeout_reason()));
    });
    task.set_deadline(Duration::from_millis(20));
    task.start();

    skein::wait_finish();
    assert_eq!(
        seen.take(),
        vec![(State::SysError, libc::ETIMEDOUT, TimeoutReason::Wait)]
    );
}

#[test]
fn test_shutdown_aborts_endless_timer() -> anyhow::Result<()> {
    let engine = Builder::new().worker_threads(1).try_build()?;
    let seen = Recorder::new();

    let recorder = seen.clone();
    let series = Series::new(create_timer_task(Duration::MAX, move |task| {
        recorder.record(task.state());
    }));
    engine.start_series(series);

    std::thread::sleep(Duration::from_millis(20));
    let handle = engine.handle().clone();
    engine.shutdown();

    assert_eq!(seen.take(), vec![State::Aborted]);
    assert_eq!(handle.outstanding(), 0);
    Ok(())
}

#[skein::test(worker_threads = 4)]
fn test_parallel_waits_past_already_started_member() {
    let seen = Recorder::new();

    let started = Series::new(create_timer_task(Duration::from_millis(20), |_| {}));
    let recorder = seen.clone();
    started.set_callback(move |_| recorder.record("started-series"));
    started.clone().start();

    let slow = Series::new(create_timer_task(Duration::from_millis(200), |_| {}));
    let recorder = seen.clone();
    slow.set_callback(move |_| recorder.record("slow-series"));

    let recorder = seen.clone();
    start_parallel_work(vec![slow, started], move |_| recorder.record("parallel"));

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["started-series", "slow-series", "parallel"]);
}

#[skein::test(worker_threads = 4)]
fn test_series_shared_by_two_parallels_finishes_once() {
    let seen = Recorder::new();

    let shared = Series::new(create_timer_task(Duration::from_millis(100), |_| {}));
    let recorder = seen.clone();
    shared.set_callback(move |_| recorder.record("shared-series"));

    let recorder = seen.clone();
    start_parallel_work(vec![shared.clone()], move |_| recorder.record("first"));
    let recorder = seen.clone();
    start_parallel_work(vec![shared], move |_| recorder.record("second"));

    skein::wait_finish();

    // Whichever parallel starts the series waits for it, the other one
    // completes straight away.
    let order = seen.take();
    assert_eq!(order.len(), 3, "{order:?}");
    assert_eq!(order[1], "shared-series", "{order:?}");
    assert!(order.contains(&"first") && order.contains(&"second"), "{order:?}");
}

#[skein::test(worker_threads = 2)]
fn test_task_callback_panic_keeps_series_going() {
    let seen = Recorder::new();

    let mut first = create_empty_task();
    first.set_callback(|_| panic!("callback bug"));

    let series = Series::new(first);
    series.push_back(mark(&seen, "next"));
    let done = seen.clone();
    series.set_callback(move |_| done.record("series"));
    series.start();

    skein::wait_finish();
    assert_eq!(seen.take(), vec!["next", "series"]);
    assert_eq!(crate::Handle::current().outstanding(), 0);
}
