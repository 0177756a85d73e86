#![allow(dead_code)]

use std::{
    fs,
    panic::{self, AssertUnwindSafe},
    path::Path,
    process::ExitCode,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessesToUpdate, System};

pub type TestCase = (&'static str, fn());

/// Minimal libtest stand-in for targets whose binary doubles as the child process.
///
/// An optional first free argument filters cases by substring, like `cargo test NAME`.
pub fn run_tests(cases: &[TestCase]) -> ExitCode {
    let filter = std::env::args().skip(1).find(|arg| !arg.starts_with('-'));
    let selected: Vec<_> = cases
        .iter()
        .filter(|(name, _)| filter.as_deref().is_none_or(|f| name.contains(f)))
        .collect();

    println!("\nrunning {} tests", selected.len());
    let mut failed = Vec::new();
    for (name, case) in &selected {
        let outcome = panic::catch_unwind(AssertUnwindSafe(case));
        match outcome {
            Ok(()) => println!("test {name} ... ok"),
            Err(_) => {
                println!("test {name} ... FAILED");
                failed.push(*name);
            }
        }
    }

    let passed = selected.len() - failed.len();
    if failed.is_empty() {
        println!("\ntest result: ok. {passed} passed; 0 failed\n");
        ExitCode::SUCCESS
    } else {
        println!("\nfailures:");
        for name in &failed {
            println!("    {name}");
        }
        println!(
            "\ntest result: FAILED. {passed} passed; {} failed\n",
            failed.len()
        );
        ExitCode::FAILURE
    }
}

pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out after {timeout:?} waiting for {what}");
        }

        thread::sleep(Duration::from_millis(20));
    }
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    wait_until(
        &format!("value '{expected}' in {path:?}"),
        Duration::from_secs(5),
        || fs::read_to_string(path).is_ok_and(|content| content.trim() == expected),
    );
}

pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| !matches!(process.status(), sysinfo::ProcessStatus::Zombie))
}

pub fn wait_for_process_exit(pid: u32) {
    wait_until(
        &format!("PID {pid} to exit"),
        Duration::from_secs(10),
        || !is_process_alive(pid),
    );
}
