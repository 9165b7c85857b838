use appwarden::config::{AppDescriptor, Environment, Paths};
use appwarden::process::output::pump_output;
use appwarden::process::{Launcher, SentinelDetector};
use appwarden::registry::PidRegistry;
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn setup(temp_dir: &TempDir) -> (Launcher, Paths) {
    let paths = Paths {
        app_dir: temp_dir.path().join("apps"),
        log_dir: temp_dir.path().join("logs"),
        var_dir: temp_dir.path().join("var"),
    };
    std::fs::create_dir_all(paths.app_dir.join("echoer")).unwrap();

    let registry = PidRegistry::open(&paths.var_dir).unwrap();
    (Launcher::new(registry, &paths), paths)
}

fn shell_app(name: &str, script: &str) -> AppDescriptor {
    AppDescriptor {
        name: name.to_string(),
        port: 3000,
        environment: Environment::Production,
        user: None,
        db_host: "localhost".to_string(),
        entry_point: PathBuf::from("-c"),
        interpreter: Some(PathBuf::from("/bin/sh")),
        args: vec![script.to_string()],
        cwd: None,
        env: HashMap::new(),
    }
}

#[tokio::test]
async fn test_output_lines_are_prefixed_in_log_files() {
    let temp_dir = TempDir::new().unwrap();
    let (launcher, paths) = setup(&temp_dir);

    let handle = launcher
        .launch(&shell_app("echoer", "echo first; echo second; echo oops >&2"))
        .await
        .unwrap();
    let pid = handle.pid;
    let (tx, _rx) = mpsc::unbounded_channel();

    let stdout = tokio::spawn(pump_output(
        "echoer".to_string(),
        pid,
        handle.stdout,
        handle.out_log,
        Some(SentinelDetector::new("THE SERVER HAS STOPPED")),
        tx.clone(),
    ));
    let stderr = tokio::spawn(pump_output(
        "echoer".to_string(),
        pid,
        handle.stderr,
        handle.err_log,
        None,
        tx,
    ));

    let mut child = handle.child;
    child.wait().await.unwrap();
    stdout.await.unwrap();
    stderr.await.unwrap();

    let out = std::fs::read_to_string(paths.log_dir.join("echoer-out.log")).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    for (line, text) in lines.iter().zip(["first", "second"]) {
        assert!(line.starts_with('['), "missing timestamp: {}", line);
        assert!(line.ends_with(&format!("] [{}] {}", pid, text)), "bad line: {}", line);
    }

    let err = std::fs::read_to_string(paths.log_dir.join("echoer-err.log")).unwrap();
    assert!(err.trim_end().ends_with(&format!("[{}] oops", pid)));
}

#[tokio::test]
async fn test_logs_are_appended_across_launches() {
    let temp_dir = TempDir::new().unwrap();
    let (launcher, paths) = setup(&temp_dir);
    let log = paths.log_dir.join("echoer-out.log");

    for _ in 0..2 {
        let handle = launcher
            .launch(&shell_app("echoer", "echo run"))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_output(
            "echoer".to_string(),
            handle.pid,
            handle.stdout,
            handle.out_log,
            None,
            tx,
        ));

        let mut child = handle.child;
        child.wait().await.unwrap();
        pump.await.unwrap();

        // The exited child leaves a stale record the next launch cleans up
        assert!(!launcher.registry().is_running("echoer").unwrap());
    }

    let content = std::fs::read_to_string(&log).unwrap();
    assert_eq!(content.lines().filter(|l| l.ends_with("] run")).count(), 2);
}

#[tokio::test]
async fn test_exactly_one_record_per_live_child() {
    let temp_dir = TempDir::new().unwrap();
    let (launcher, _paths) = setup(&temp_dir);
    let app = shell_app("echoer", "exec sleep 30");

    let mut handle = launcher.launch(&app).await.unwrap();
    assert!(launcher.launch(&app).await.is_err());

    let running = launcher.registry().list_running().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].child_pid, handle.pid);

    handle.child.kill().await.unwrap();
    assert!(!launcher.registry().is_running("echoer").unwrap());
}

#[tokio::test]
async fn test_absolute_missing_entry_point_is_spawn_error() {
    let temp_dir = TempDir::new().unwrap();
    let (launcher, _paths) = setup(&temp_dir);

    let mut app = shell_app("echoer", "");
    app.interpreter = None;
    app.entry_point = temp_dir.path().join("apps/echoer/server");

    let result = launcher.launch(&app).await;
    assert!(matches!(
        result,
        Err(appwarden::error::WardenError::SpawnError(_))
    ));
    assert!(launcher.registry().list_running().unwrap().is_empty());
}
