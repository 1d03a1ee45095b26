//! Executor behaviour against real `/bin/sh` processes

use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use forge_engine::conductor::{ExecutionRequest, Executor};
use forge_engine::config::ExecutionConfig;
use sdk::types::Outcome;

fn executor(dir: &Path, timeout_secs: u64, max_output_lines: usize, sandbox: bool) -> Executor {
    Executor::new(
        ExecutionConfig {
            timeout_secs,
            interpreter: "sh".to_string(),
            artifact_extension: "sh".to_string(),
            sandbox_dir: dir.to_path_buf(),
            max_output_lines,
            syntax_check: vec!["sh".to_string(), "-n".to_string()],
            teardown_grace_ms: 200,
            ..ExecutionConfig::default()
        },
        sandbox,
    )
}

fn request(artifact: &str) -> ExecutionRequest {
    ExecutionRequest {
        task_id: "task-1".to_string(),
        step_id: "step-1".to_string(),
        sequence_index: 0,
        attempt_number: 1,
        artifact: artifact.to_string(),
    }
}

#[tokio::test]
async fn test_success_captures_stdout() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 100, true);

    let result = exec.run(&request("echo one\necho two")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "one\ntwo");
    assert!(result.stderr.is_empty());
    assert_eq!(result.step_id, "step-1");
    assert_eq!(result.attempt_number, 1);

    // The artifact stays on disk in the step's directory
    let artifact = dir.path().join("task-1").join("step_1").join("main.sh");
    assert_eq!(std::fs::read_to_string(artifact).unwrap(), "echo one\necho two");
}

#[tokio::test]
async fn test_nonzero_exit_is_exception() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 100, true);

    let result = exec
        .run(&request("echo partial\necho failure >&2\nexit 7"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Exception);
    assert_eq!(result.exit_code, Some(7));
    assert_eq!(result.stdout, "partial");
    assert_eq!(result.stderr, "failure");
}

#[tokio::test]
async fn test_timeout_kills_process_group() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 1, 100, true);

    let started = Instant::now();
    let result = exec
        .run(&request("echo started\nsleep 30 &\nsleep 30"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.duration_ms >= 1000);
    assert_eq!(result.stdout, "started");
}

#[tokio::test]
async fn test_timeout_without_sandbox_still_returns() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 1, 100, false);

    let started = Instant::now();
    let result = exec.run(&request("sleep 30")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_output_keeps_newest_lines() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 3, true);

    let result = exec
        .run(&request("for i in 1 2 3 4 5 6; do echo line$i; done"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(
        result.stdout,
        "... (truncated 3 lines)\nline4\nline5\nline6"
    );
}

#[tokio::test]
async fn test_output_is_bounded_in_bytes() {
    let dir = TempDir::new().unwrap();
    let config = ExecutionConfig {
        timeout_secs: 10,
        interpreter: "sh".to_string(),
        artifact_extension: "sh".to_string(),
        sandbox_dir: dir.path().to_path_buf(),
        syntax_check: vec![],
        max_output_bytes: 1000,
        teardown_grace_ms: 200,
        ..ExecutionConfig::default()
    };
    let exec = Executor::new(config, true);

    // One 20 MB line on stdout, many short lines on stderr
    let result = exec
        .run(&request(
            "head -c 20000000 /dev/zero | tr '\\0' x\n\
             i=0; while [ $i -lt 500 ]; do echo \"row $i of the error log\" >&2; i=$((i+1)); done",
        ))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert!(result.stdout.len() < 20 * 1024, "stdout kept {} bytes", result.stdout.len());
    assert!(result.stdout.ends_with("bytes)"));
    assert!(result.stdout.contains("... (cut "));

    assert!(result.stderr.len() < 1200, "stderr kept {} bytes", result.stderr.len());
    assert!(result.stderr.starts_with("... (truncated "));
    assert!(result.stderr.ends_with("row 499 of the error log"));
}

#[tokio::test]
async fn test_background_job_does_not_outlive_step() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 100, true);

    let result = exec
        .run(&request(
            "(sleep 1; echo late > late.txt) >/dev/null 2>&1 &\necho done",
        ))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "done");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let step_dir = dir.path().join("task-1").join("step_1");
    assert!(!step_dir.join("late.txt").exists());
}

#[tokio::test]
async fn test_syntax_check_rejects_before_running() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 100, true);

    let result = exec.run(&request("echo before\nif then")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Exception);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.to_lowercase().contains("syntax error"));
    assert_ne!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_missing_syntax_checker_is_skipped() {
    let dir = TempDir::new().unwrap();
    let exec = Executor::new(
        ExecutionConfig {
            interpreter: "sh".to_string(),
            artifact_extension: "sh".to_string(),
            sandbox_dir: dir.path().to_path_buf(),
            syntax_check: vec!["forge-no-such-checker".to_string()],
            ..ExecutionConfig::default()
        },
        true,
    );

    let result = exec.run(&request("echo ran")).await.unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout, "ran");
}

#[tokio::test]
async fn test_sandbox_clears_environment() {
    let dir = TempDir::new().unwrap();
    std::env::set_var("FORGE_EXECUTOR_SECRET", "visible");

    let sandboxed = executor(dir.path(), 5, 100, true);
    let result = sandboxed
        .run(&request("echo \"[${FORGE_EXECUTOR_SECRET}]\""))
        .await
        .unwrap();
    assert_eq!(result.stdout, "[]");

    let open = executor(dir.path(), 5, 100, false);
    let result = open
        .run(&request("echo \"[${FORGE_EXECUTOR_SECRET}]\""))
        .await
        .unwrap();
    assert_eq!(result.stdout, "[visible]");
}

#[tokio::test]
async fn test_missing_interpreter_is_exception() {
    let dir = TempDir::new().unwrap();
    let exec = Executor::new(
        ExecutionConfig {
            interpreter: "forge-no-such-interpreter".to_string(),
            sandbox_dir: dir.path().to_path_buf(),
            syntax_check: vec![],
            ..ExecutionConfig::default()
        },
        true,
    );

    let result = exec.run(&request("print(1)")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Exception);
    assert!(result.exit_code.is_none());
    assert!(result.stderr.contains("forge-no-such-interpreter"));
}

#[tokio::test]
async fn test_attempts_reuse_step_directory() {
    let dir = TempDir::new().unwrap();
    let exec = executor(dir.path(), 5, 100, true);

    exec.run(&request("echo first > note.txt")).await.unwrap();
    let mut second = request("cat note.txt");
    second.attempt_number = 2;
    let result = exec.run(&second).await.unwrap();

    assert_eq!(result.stdout, "first");
    assert_eq!(result.attempt_number, 2);
}
