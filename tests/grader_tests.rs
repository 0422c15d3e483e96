
use std::time::Duration;

use graderd::config::StageConfig;
use graderd::error::GraderdError;
use graderd::grader::{SCORE_SPAWN_FAILED, SCORE_TIMED_OUT};
use test_harness::{grader_with, job_dirs, sh};

#[tokio::test]
async fn score_and_feedback_come_from_the_grade_command() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("echo ok; exit 7"),
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.gid, "g1");
    assert_eq!(report.score, 7);
    assert!(report.feedback.contains("ok"));
}

#[tokio::test]
async fn workspace_is_removed_after_success() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("exit 0"),
            ..Default::default()
        },
    );

    grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(job_dirs(root.path()), 0);
}

#[tokio::test]
async fn workspace_is_removed_after_grade_timeout() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("sleep 10"),
            grade_timeout: 1,
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.score, SCORE_TIMED_OUT);
    assert!(report.feedback.contains("timed out"));
    assert_eq!(job_dirs(root.path()), 0);
}

#[tokio::test]
async fn workspace_is_removed_when_setup_fails() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![sh("exit 1")],
            grade_command: sh("exit 0"),
            ..Default::default()
        },
    );

    grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(job_dirs(root.path()), 0);
}

#[tokio::test]
async fn grade_runs_even_when_setup_fails() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![sh("exit 1"), sh("exit 2")],
            grade_command: sh("exit 3"),
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.score, 3);
}

#[tokio::test]
async fn cleanup_runs_when_setup_fails() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![sh("exit 1")],
            grade_command: sh("exit 0"),
            cleanup_commands: vec![sh("touch ${GRADERD_GRADER_ROOT}/cleanup_ran")],
            ..Default::default()
        },
    );

    grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    // The marker lands outside the workspace, so it survives removal.
    assert!(grader.grader_root().join("cleanup_ran").exists());
}

#[tokio::test]
async fn cleanup_runs_when_grade_times_out() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("sleep 10"),
            cleanup_commands: vec![sh("touch ${GRADERD_GRADER_ROOT}/cleanup_ran")],
            grade_timeout: 1,
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.score, SCORE_TIMED_OUT);
    assert!(grader.grader_root().join("cleanup_ran").exists());
}

#[tokio::test]
async fn timeout_is_not_conflated_with_zero_exit() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: vec!["sleep".to_string(), "10".to_string()],
            grade_timeout: 1,
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_ne!(report.score, 0);
    assert_eq!(report.score, SCORE_TIMED_OUT);
}

#[tokio::test]
async fn unrunnable_grade_command_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: vec!["/nonexistent/graderd-grade".to_string()],
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.score, SCORE_SPAWN_FAILED);
    assert!(report.feedback.contains("could not run"));
}

#[tokio::test]
async fn malformed_payload_allocates_nothing_and_runs_nothing() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![sh("touch ${GRADERD_GRADER_ROOT}/setup_ran")],
            grade_command: sh("exit 0"),
            ..Default::default()
        },
    );

    let err = grader.grade(br#"{"not_gid":"x"}"#).await.unwrap_err();
    assert!(matches!(err, GraderdError::MalformedJob(_)));
    assert_eq!(job_dirs(root.path()), 0);
    assert!(!grader.grader_root().join("setup_ran").exists());
}

#[tokio::test]
async fn job_payload_is_visible_to_stage_commands() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("cat ${GRADERD_JOB_DIR}/job.json"),
            ..Default::default()
        },
    );

    let report = grader
        .grade(br#"{"gid":"g9","submission":"hello"}"#)
        .await
        .unwrap();
    assert_eq!(report.score, 0);
    assert!(report.feedback.contains("g9"));
    assert!(report.feedback.contains("hello"));
}

#[tokio::test]
async fn init_pipeline_runs_in_the_grader_root() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            init_commands: vec![sh("touch init_ran"), sh("touch ${GRADERD_GRADER_ROOT}/init_env")],
            ..Default::default()
        },
    );

    grader.run_init().await;
    assert!(grader.grader_root().join("init_ran").exists());
    assert!(grader.grader_root().join("init_env").exists());
}

#[tokio::test]
async fn setup_commands_run_in_order_inside_the_workspace() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![sh("printf one > order.txt"), sh("printf two >> order.txt")],
            grade_command: sh("cat order.txt"),
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.feedback, "onetwo");
}

#[tokio::test]
async fn list_stage_failure_does_not_abort_remaining_commands() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            setup_commands: vec![
                sh("exit 1"),
                vec!["/nonexistent/graderd-setup".to_string()],
                sh("touch after_failures"),
            ],
            grade_command: sh("test -f after_failures"),
            ..Default::default()
        },
    );

    let report = grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert_eq!(report.score, 0, "command after failures did not run");
}

#[tokio::test]
async fn grade_timeout_bounds_the_wall_clock() {
    let root = tempfile::tempdir().unwrap();
    let grader = grader_with(
        root.path(),
        StageConfig {
            grade_command: sh("sleep 30"),
            grade_timeout: 1,
            ..Default::default()
        },
    );

    let begun = std::time::Instant::now();
    grader.grade(br#"{"gid":"g1"}"#).await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(10));
}
