#[path = "common/mod.rs"]
mod common;

use common::{TestCase, is_process_alive, run_tests, wait_for_file_value, wait_for_process_exit, wait_until};
use nix::sys::signal::{SigHandler, Signal};
use std::{
    collections::HashSet,
    env, fs,
    process::{Command, ExitCode},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use subproc::{
    CmdOptions, Manager, ManagerConfig, MatchOptions, ResponseSlot, Subproc, SubprocError,
    WorkerStatus,
};
use tempfile::tempdir;

const SETTLE: Duration = Duration::from_secs(10);

fn sleep_forever() {
    loop {
        thread::sleep(Duration::from_millis(100));
    }
}

fn register_entrypoints() {
    subproc::register("echo-ok", || subproc::succeed("pong"));
    subproc::register("always-fail", || subproc::fail("boom"));
    subproc::register("panics", || panic!("mock panic"));
    subproc::register("crash", || std::process::exit(3));
    subproc::register("silent", || {});
    subproc::register("hello", sleep_forever);
    subproc::register("hello2", sleep_forever);
    subproc::register("spawns-then-loops", || {
        let sleeper = match Command::new("sleep").arg("30").spawn() {
            Ok(sleeper) => sleeper,
            Err(err) => subproc::fail(err),
        };
        if let Some(path) = env::args().nth(1) {
            fs::write(path, sleeper.id().to_string()).unwrap();
        }
        sleep_forever();
    });
    subproc::register("stubborn", || {
        // SAFETY: single-threaded child; no handler is installed.
        if let Err(err) = unsafe { nix::sys::signal::signal(Signal::SIGINT, SigHandler::SigIgn) } {
            subproc::fail(err);
        }
        if let Some(ready) = env::args().nth(1) {
            fs::write(ready, "ready").unwrap();
        }
        sleep_forever();
    });
}

fn fast_config(max_restarts: u32) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.backoff.first = Duration::from_millis(10);
    config.backoff.max_restarts = max_restarts;
    config
}

fn wait_for_status(worker: &Subproc, status: WorkerStatus) {
    wait_until(&format!("{} to be {status}", worker.id()), SETTLE, || {
        worker.status() == status
    });
}

fn wait_for_pid(worker: &Subproc) -> u32 {
    wait_until(&format!("{} to spawn", worker.id()), SETTLE, || {
        worker.pid().is_some()
    });
    worker.pid().unwrap()
}

fn ids(workers: &[Arc<Subproc>]) -> HashSet<String> {
    workers.iter().map(|worker| worker.id().to_string()).collect()
}

fn echo_ok_reports_payload() {
    let manager = Manager::new();
    let slot: ResponseSlot<String> = ResponseSlot::new();
    let worker = manager
        .run("echo-ok", CmdOptions::new().with_response(&slot))
        .unwrap();

    wait_for_status(&worker, WorkerStatus::Exited);
    assert_eq!(slot.get().as_deref(), Some("pong"));
    assert!(worker.error().is_none());
    assert_eq!(worker.restarts(), 0);

    let metrics = worker.metrics();
    assert!(metrics.started_at.is_some());
    assert!(metrics.exited_at.is_some());
    assert!(metrics.exited_at >= metrics.started_at);

    manager.stop();
}

fn always_fail_enters_crash_loop() {
    let manager = Manager::new();
    let worker = manager.run("always-fail", CmdOptions::default()).unwrap();

    wait_until("three restart cycles", SETTLE, || {
        worker.restarts() >= 3 && worker.status() == WorkerStatus::CrashLoopBackOff
    });
    let error = worker.error().unwrap();
    assert!(error.contains("boom"), "unexpected error: {error}");
    assert_eq!(error, "Command Error: exit status: 1, Message: boom");

    manager.stop();
}

fn kill_by_id_interrupts_child() {
    let manager = Manager::new();
    let worker = manager.run("hello", CmdOptions::default()).unwrap();
    let pid = wait_for_pid(&worker);
    assert!(is_process_alive(pid));

    manager
        .kill(&MatchOptions::new().with_ids([worker.id()]))
        .unwrap();

    let listed = manager.list_all();
    assert!(
        listed
            .values()
            .flatten()
            .all(|listed| listed.id() != worker.id())
    );
    assert!(!listed.contains_key("hello"));

    wait_for_process_exit(pid);
    wait_for_status(&worker, WorkerStatus::Exited);
    assert!(worker.is_stopped());
    manager.stop();
}

fn kill_by_cmd_leaves_other_commands() {
    let manager = Manager::new();
    let first = manager.run("hello", CmdOptions::default()).unwrap();
    let second = manager.run("hello2", CmdOptions::default()).unwrap();

    manager.kill(&MatchOptions::new().with_cmds(["hello"])).unwrap();

    let listed = manager.list_all();
    assert_eq!(listed.len(), 1);
    assert_eq!(ids(&listed["hello2"]), HashSet::from([second.id().to_string()]));
    assert!(first.is_stopped());
    assert!(!second.is_stopped());

    manager.stop();
    assert!(second.is_stopped());
}

fn list_counts_every_run() {
    let manager = Manager::new();
    for _ in 0..3 {
        manager.run("hello", CmdOptions::default()).unwrap();
    }
    manager.run("hello2", CmdOptions::default()).unwrap();

    let listed = manager.list_all();
    assert_eq!(listed["hello"].len(), 3);
    assert_eq!(listed["hello2"].len(), 1);
    assert_eq!(manager.len(), 4);
    assert_eq!(ids(&listed["hello"]).len(), 3);

    manager.kill_all().unwrap();
    assert!(manager.list_all().is_empty());
    assert!(manager.is_empty());
    manager.stop();
}

fn list_filters_by_status() {
    let manager = Manager::new();
    let done = manager.run("echo-ok", CmdOptions::default()).unwrap();
    let live = manager.run("hello", CmdOptions::default()).unwrap();
    wait_for_status(&done, WorkerStatus::Exited);
    wait_for_status(&live, WorkerStatus::Running);

    let exited = manager.list(&MatchOptions::new().with_status(WorkerStatus::Exited));
    assert_eq!(exited.len(), 1);
    assert_eq!(ids(&exited["echo-ok"]), HashSet::from([done.id().to_string()]));

    let healthy = manager.list(&MatchOptions::new().with_has_error(false));
    assert_eq!(healthy.values().map(Vec::len).sum::<usize>(), 2);

    manager.stop();
}

fn restart_replaces_worker_in_place() {
    let manager = Manager::new();
    let before = manager.run("hello", CmdOptions::default()).unwrap();
    let neighbour = manager.run("hello", CmdOptions::default()).unwrap();
    let old_pid = wait_for_pid(&before);

    manager
        .restart(&MatchOptions::new().with_ids([before.id()]))
        .unwrap();

    let listed = manager.list_all();
    let workers = &listed["hello"];
    assert_eq!(workers.len(), 2);
    let after = &workers[0];
    assert_ne!(after.id(), before.id());
    assert_eq!(after.cmd(), before.cmd());
    assert_eq!(after.restarts(), 0);
    assert!(after.metrics().created_at >= before.metrics().created_at);
    assert_eq!(workers[1].id(), neighbour.id());

    assert!(before.is_stopped());
    wait_for_process_exit(old_pid);
    let new_pid = wait_for_pid(after);
    assert_ne!(new_pid, old_pid);

    manager.stop();
}

fn restart_unknown_id_reports_no_match() {
    let manager = Manager::new();
    manager.run("hello", CmdOptions::default()).unwrap();

    let missing = MatchOptions::new().with_ids(["hello-missing"]);
    assert!(matches!(manager.restart(&missing), Err(SubprocError::NoMatch)));
    assert!(matches!(manager.kill(&missing), Err(SubprocError::NoMatch)));
    assert_eq!(manager.len(), 1);

    manager.stop();
}

fn panicking_entrypoint_reports_failure() {
    let manager = Manager::with_config(fast_config(1));
    let worker = manager.run("panics", CmdOptions::default()).unwrap();

    manager.wait();
    assert_eq!(worker.status(), WorkerStatus::CrashLoopBackOff);
    let error = worker.error().unwrap();
    assert!(error.contains("mock panic"), "unexpected error: {error}");

    manager.stop();
}

fn wait_drains_failing_workers() {
    let manager = Manager::with_config(fast_config(2));
    let failing = manager.run("always-fail", CmdOptions::default()).unwrap();
    let crashing = manager.run("crash", CmdOptions::default()).unwrap();

    manager.wait();
    assert_eq!(failing.restarts(), 2);
    assert_eq!(crashing.restarts(), 2);
    assert_eq!(crashing.status(), WorkerStatus::CrashLoopBackOff);

    let error = crashing.error().unwrap();
    assert!(
        error.starts_with("Command Error: exit status: 3, Failed to get result:"),
        "unexpected error: {error}"
    );

    manager.stop();
}

fn silent_entrypoint_exits_cleanly() {
    let manager = Manager::new();
    let worker = manager.run("silent", CmdOptions::default()).unwrap();

    wait_for_status(&worker, WorkerStatus::Exited);
    assert!(worker.error().is_none());
    manager.stop();
}

fn stop_during_backoff_prevents_respawn() {
    let mut config = ManagerConfig::default();
    config.backoff.first = Duration::from_secs(30);
    let manager = Manager::with_config(config);
    let worker = manager.run("always-fail", CmdOptions::default()).unwrap();

    wait_for_status(&worker, WorkerStatus::CrashLoopBackOff);
    let started = Instant::now();
    manager.stop();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(worker.restarts(), 1);
    assert_eq!(worker.status(), WorkerStatus::CrashLoopBackOff);
    assert!(worker.pid().is_none());
}

fn concurrent_stop_is_idempotent() {
    let manager = Arc::new(Manager::new());
    let workers: Vec<_> = (0..2)
        .map(|_| manager.run("hello", CmdOptions::default()).unwrap())
        .collect();
    let pids: Vec<_> = workers.iter().map(|worker| wait_for_pid(worker)).collect();

    let stoppers: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.stop())
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap();
    }
    manager.stop();

    assert!(manager.is_closed());
    assert!(manager.list_all().is_empty());
    for pid in pids {
        assert!(!is_process_alive(pid));
    }
    for worker in &workers {
        assert_eq!(worker.status(), WorkerStatus::Exited);
    }
}

fn closed_manager_rejects_mutations() {
    let manager = Manager::new();
    manager.run("echo-ok", CmdOptions::default()).unwrap();
    manager.stop();

    assert!(matches!(
        manager.run("echo-ok", CmdOptions::default()),
        Err(SubprocError::ManagerClosed)
    ));
    assert!(matches!(
        manager.kill(&MatchOptions::new().with_cmds(["echo-ok"])),
        Err(SubprocError::ManagerClosed)
    ));
    assert!(matches!(manager.restart_all(), Err(SubprocError::ManagerClosed)));
    assert!(manager.list_all().is_empty());
}

fn run_parallel_scales_and_reloads() {
    let manager = Manager::new();
    manager.run_parallel(3, "hello", CmdOptions::default()).unwrap();
    let first = ids(&manager.list_all()["hello"]);
    assert_eq!(first.len(), 3);

    manager
        .run_parallel(1, "hello", CmdOptions::new().with_args(["reloaded"]))
        .unwrap();
    let listed = manager.list_all();
    let survivors = &listed["hello"];
    assert_eq!(survivors.len(), 1);
    assert!(!first.contains(survivors[0].id()));
    assert_eq!(survivors[0].options().args, vec!["reloaded".to_string()]);

    manager.run_parallel(2, "hello", CmdOptions::default()).unwrap();
    assert_eq!(manager.list_all()["hello"].len(), 2);

    manager.run_parallel(0, "hello", CmdOptions::default()).unwrap();
    assert!(!manager.list_all().contains_key("hello"));

    manager.stop();
}

fn kill_timeout_escalates_to_sigkill() {
    let dir = tempdir().unwrap();
    let ready = dir.path().join("ready");

    let mut config = ManagerConfig::default();
    config.kill_timeout = Some(Duration::from_millis(200));
    let manager = Manager::with_config(config);
    let worker = manager
        .run(
            "stubborn",
            CmdOptions::new().with_args([ready.to_string_lossy().into_owned()]),
        )
        .unwrap();

    let pid = wait_for_pid(&worker);
    wait_for_file_value(&ready, "ready");

    manager.stop();
    assert!(!is_process_alive(pid));
    assert_eq!(worker.status(), WorkerStatus::Exited);
}

fn stop_is_not_held_up_by_descendants() {
    let dir = tempdir().unwrap();
    let pid_file = dir.path().join("sleeper.pid");

    let manager = Manager::new();
    let worker = manager
        .run(
            "spawns-then-loops",
            CmdOptions::new().with_args([pid_file.to_string_lossy().into_owned()]),
        )
        .unwrap();
    let child = wait_for_pid(&worker);
    wait_until("sleeper pid to be recorded", SETTLE, || {
        fs::read_to_string(&pid_file).is_ok_and(|content| !content.trim().is_empty())
    });
    let sleeper: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

    let started = Instant::now();
    manager.stop();
    let elapsed = started.elapsed();
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(sleeper as i32),
        Signal::SIGKILL,
    );

    assert!(elapsed < Duration::from_secs(10), "stop took {elapsed:?}");
    assert!(!is_process_alive(child));
    assert_eq!(worker.status(), WorkerStatus::Exited);
}

fn default_manager_free_functions() {
    let slot: ResponseSlot<String> = ResponseSlot::new();
    let worker = subproc::run("echo-ok", CmdOptions::new().with_response(&slot)).unwrap();
    subproc::run("hello", CmdOptions::default()).unwrap();

    wait_for_status(&worker, WorkerStatus::Exited);
    assert_eq!(slot.take().as_deref(), Some("pong"));
    assert_eq!(subproc::list_all().values().map(Vec::len).sum::<usize>(), 2);

    subproc::kill(&MatchOptions::new().with_cmds(["hello"])).unwrap();
    assert_eq!(
        subproc::list(&MatchOptions::new().with_cmds(["hello"])).len(),
        0
    );

    subproc::stop();
    subproc::wait();
    assert!(subproc::default_manager().is_closed());
    assert!(matches!(
        subproc::run("echo-ok", CmdOptions::default()),
        Err(SubprocError::ManagerClosed)
    ));
}

fn main() -> ExitCode {
    register_entrypoints();
    if subproc::init() {
        return ExitCode::SUCCESS;
    }

    let cases: &[TestCase] = &[
        ("echo_ok_reports_payload", echo_ok_reports_payload),
        ("always_fail_enters_crash_loop", always_fail_enters_crash_loop),
        ("kill_by_id_interrupts_child", kill_by_id_interrupts_child),
        ("kill_by_cmd_leaves_other_commands", kill_by_cmd_leaves_other_commands),
        ("list_counts_every_run", list_counts_every_run),
        ("list_filters_by_status", list_filters_by_status),
        ("restart_replaces_worker_in_place", restart_replaces_worker_in_place),
        ("restart_unknown_id_reports_no_match", restart_unknown_id_reports_no_match),
        ("panicking_entrypoint_reports_failure", panicking_entrypoint_reports_failure),
        ("wait_drains_failing_workers", wait_drains_failing_workers),
        ("silent_entrypoint_exits_cleanly", silent_entrypoint_exits_cleanly),
        ("stop_during_backoff_prevents_respawn", stop_during_backoff_prevents_respawn),
        ("concurrent_stop_is_idempotent", concurrent_stop_is_idempotent),
        ("closed_manager_rejects_mutations", closed_manager_rejects_mutations),
        ("run_parallel_scales_and_reloads", run_parallel_scales_and_reloads),
        ("kill_timeout_escalates_to_sigkill", kill_timeout_escalates_to_sigkill),
        ("stop_is_not_held_up_by_descendants", stop_is_not_held_up_by_descendants),
        ("default_manager_free_functions", default_manager_free_functions),
    ];
    run_tests(cases)
}
