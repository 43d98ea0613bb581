// ABOUTME: Session supervisor tests against real OS processes: start, stop, pause, reconcile, archive

#![cfg(unix)]

use agents_runner::config::ManagerConfig;
use agents_runner::models::SessionStatus;
use agents_runner::session::{OsProcessHost, SessionError, SessionManager, SessionStore, StartRequest};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn manager(dir: &TempDir) -> SessionManager {
    let store = SessionStore::new(dir.path().join("sessions")).unwrap();
    SessionManager::new(
        store,
        Arc::new(OsProcessHost::new()),
        ManagerConfig {
            stop_grace_period: Duration::from_secs(2),
        },
    )
}

fn request(name: &str, script: &str, dir: &TempDir) -> StartRequest {
    StartRequest::new(
        name,
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        dir.path(),
    )
}

async fn wait_for_status(manager: &SessionManager, name: &str, status: SessionStatus) -> bool {
    for _ in 0..100 {
        if manager.get_session(name).unwrap().status == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_start_and_stop_real_process() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    let state = manager.start_session(request("sleeper", "exec sleep 30", &temp_dir)).unwrap();
    assert_eq!(state.status, SessionStatus::Running);
    assert!(state.pid > 0);
    assert!(manager.is_process_running(state.pid));

    let loaded = manager.store().load("sleeper").unwrap();
    assert_eq!(loaded.status, SessionStatus::Running);
    assert_eq!(loaded.pid, state.pid);
    assert!(loaded.pid > 0);

    let stopped = manager.stop_session("sleeper").await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.end_time.is_some());

    for _ in 0..50 {
        if !manager.is_process_running(state.pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!manager.is_process_running(state.pid));

    assert!(matches!(
        manager.stop_session("sleeper").await,
        Err(SessionError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_exited_process_is_reconciled_to_completed() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    manager
        .start_session(request("quick", "echo hello from the agent", &temp_dir))
        .unwrap();
    assert!(wait_for_status(&manager, "quick", SessionStatus::Completed).await);

    let state = manager.get_session("quick").unwrap();
    assert!(state.end_time.is_some());

    let logs = manager.session_logs("quick", 10).unwrap();
    assert_eq!(logs, vec!["hello from the agent".to_string()]);
}

#[tokio::test]
async fn test_duplicate_names_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    manager.start_session(request("dup", "exec sleep 30", &temp_dir)).unwrap();
    assert!(matches!(
        manager.start_session(request("dup", "exec sleep 30", &temp_dir)),
        Err(SessionError::AlreadyExists(_))
    ));
    assert!(matches!(
        manager.start_session(request("../escape", "true", &temp_dir)),
        Err(SessionError::InvalidName(_))
    ));

    manager.remove_session("dup", true).unwrap();
}

#[tokio::test]
async fn test_pause_and_resume() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    manager.start_session(request("pausable", "exec sleep 30", &temp_dir)).unwrap();

    let paused = manager.pause_session("pausable").unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert!(paused.end_time.is_none());
    assert!(matches!(
        manager.pause_session("pausable"),
        Err(SessionError::InvalidTransition { .. })
    ));

    let resumed = manager.resume_session("pausable").unwrap();
    assert_eq!(resumed.status, SessionStatus::Running);

    manager.stop_session("pausable").await.unwrap();
}

#[tokio::test]
async fn test_remove_requires_force_while_running() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    let state = manager.start_session(request("busy", "exec sleep 30", &temp_dir)).unwrap();
    assert!(matches!(
        manager.remove_session("busy", false),
        Err(SessionError::RunningSession(_))
    ));

    manager.remove_session("busy", true).unwrap();
    assert!(!manager.store().exists("busy"));
    assert!(!state.log_file.exists());
    assert!(matches!(manager.get_session("busy"), Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn test_archive_then_unarchive_moves_log_with_record() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    manager
        .start_session(request("finished", "echo archived output", &temp_dir))
        .unwrap();
    assert!(wait_for_status(&manager, "finished", SessionStatus::Completed).await);

    assert!(matches!(
        manager.start_session(request("live", "exec sleep 30", &temp_dir)),
        Ok(_)
    ));
    assert!(matches!(
        manager.archive_session("live"),
        Err(SessionError::RunningSession(_))
    ));
    manager.remove_session("live", true).unwrap();

    let archived = manager.archive_session("finished").unwrap();
    assert_eq!(archived.status, SessionStatus::Archived);
    assert!(!manager.store().exists("finished"));
    assert!(manager.store().archived_exists("finished"));
    assert!(archived.log_file.starts_with(manager.store().archived_dir()));
    assert!(archived.log_file.exists());

    let names: Vec<String> = manager
        .list_archived_sessions()
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["finished".to_string()]);
    assert!(manager.list_sessions().unwrap().is_empty());

    let restored = manager.unarchive_session("finished").unwrap();
    assert_eq!(restored.status, SessionStatus::Completed);
    assert_eq!(restored.log_file, manager.store().log_path("finished"));
    assert_eq!(
        manager.session_logs("finished", 5).unwrap(),
        vec!["archived output".to_string()]
    );
}

#[tokio::test]
async fn test_rename_and_restart_finished_session() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(&temp_dir);

    manager.start_session(request("first", "echo run", &temp_dir)).unwrap();
    assert!(wait_for_status(&manager, "first", SessionStatus::Completed).await);

    let renamed = manager.rename_session("first", "second").unwrap();
    assert_eq!(renamed.name, "second");
    assert!(!manager.store().exists("first"));

    let restarted = manager.restart_session("second").unwrap();
    assert_eq!(restarted.status, SessionStatus::Running);
    assert!(wait_for_status(&manager, "second", SessionStatus::Completed).await);

    let logs = manager.session_logs("second", 10).unwrap();
    assert_eq!(logs.first().map(String::as_str), Some("run"));
    assert!(logs.iter().any(|line| line.starts_with("--- restarted at")));
    assert_eq!(logs.last().map(String::as_str), Some("run"));
}
