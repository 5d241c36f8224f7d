//! End-to-end behavior shared by both backends
//!
//! Container cases return early when no Docker daemon is reachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use warden_sandbox::{
    Capability, Deadline, DockerConfig, DockerSandbox, ErrorKind, ExecutionRequest, HostBridge,
    Policy, SandboxBackend, WasmBackend,
};

const EXIT_42: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 42))))
"#;

const GREETING: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "deterministic\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 14))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

fn exec_policy(commands: &[&str]) -> Policy {
    commands
        .iter()
        .fold(Policy::new().with_capability(Capability::ExecRun), |policy, cmd| {
            policy.allow_command(*cmd)
        })
}

fn wasm_backend(policy: Policy) -> Arc<dyn SandboxBackend> {
    Arc::new(assert_ok!(WasmBackend::new(policy)))
}

async fn container_backend(config: DockerConfig) -> Option<Arc<dyn SandboxBackend>> {
    if !DockerSandbox::is_docker_available().await {
        eprintln!("docker not available, skipping container case");
        return None;
    }
    let sandbox = assert_ok!(DockerSandbox::connect(config, None).await);
    assert_ok!(sandbox.ensure_image().await);
    Some(Arc::new(sandbox))
}

async fn backends(policy: Policy, config: DockerConfig) -> Vec<Arc<dyn SandboxBackend>> {
    let mut all = vec![wasm_backend(policy)];
    all.extend(container_backend(config).await);
    all
}

/// Whether any live process carries `marker` in its command line
#[cfg(target_os = "linux")]
fn process_running(marker: &str) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    entries.flatten().any(|entry| {
        std::fs::read(entry.path().join("cmdline"))
            .map(|raw| String::from_utf8_lossy(&raw).contains(marker))
            .unwrap_or(false)
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_hello_world_on_every_backend() {
    for backend in backends(exec_policy(&["echo"]), DockerConfig::default()).await {
        let output = assert_ok!(
            backend
                .execute(
                    ExecutionRequest::command("echo", &["hello", "world"]),
                    Deadline::none()
                )
                .await
        );
        assert_eq!(output.exit_code, 0, "backend {}", backend.name());
        assert_eq!(output.stdout, b"hello world\n");
        assert!(output.stderr.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_code_42_is_a_result_not_an_error() {
    for backend in backends(exec_policy(&["sh"]), DockerConfig::default()).await {
        let output = assert_ok!(
            backend
                .execute(
                    ExecutionRequest::command("sh", &["-c", "exit 42"]),
                    Deadline::none()
                )
                .await
        );
        assert_eq!(output.exit_code, 42, "backend {}", backend.name());
    }

    let backend = wasm_backend(Policy::new());
    let output = assert_ok!(
        backend
            .execute(
                ExecutionRequest::Bytes {
                    wasm: EXIT_42.as_bytes().to_vec(),
                    stdin: Vec::new(),
                },
                Deadline::none(),
            )
            .await
    );
    assert_eq!(output.exit_code, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_under_short_timeout_is_killed() {
    let marker = "10.731";
    let policy = exec_policy(&["sleep"]).with_timeout(Duration::from_millis(500));
    let config = DockerConfig::default().with_timeout(Duration::from_millis(500));

    for backend in backends(policy, config).await {
        let started = Instant::now();
        let err = assert_err!(
            backend
                .execute(
                    ExecutionRequest::command("sleep", &[marker]),
                    Deadline::none()
                )
                .await
        );
        assert_eq!(err.kind(), ErrorKind::Timeout, "backend {}", backend.name());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    assert!(!process_running(marker));
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_cancellation_surfaces_as_timeout() {
    let backend = wasm_backend(exec_policy(&["sleep"]));
    let token = CancellationToken::new();
    let deadline = Deadline::none().with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let err = assert_err!(
        backend
            .execute(ExecutionRequest::command("sleep", &["5"]), deadline)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_ok!(canceller.await);
}

#[tokio::test]
async fn missing_capabilities_have_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = assert_ok!(HostBridge::new(
        Policy::new()
            .allow_path(dir.path())
            .allow_command("touch")
            .allow_host("127.0.0.1")
    ));
    let target = dir.path().join("created.txt");

    let err = assert_err!(bridge.fs_write(&target, b"data").await);
    assert_eq!(err.kind(), ErrorKind::Capability);

    let touched = dir.path().join("touched");
    let err = assert_err!(
        bridge
            .exec_run(
                "touch",
                &[touched.display().to_string()],
                &Deadline::none()
            )
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Capability);

    // Nothing listens here; reaching the network would fail differently
    let err = assert_err!(
        bridge
            .http_fetch("GET", "http://127.0.0.1:9/", None, &[], &Deadline::none())
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Capability);

    assert!(!target.exists());
    assert!(!touched.exists());
}

#[tokio::test]
async fn empty_command_allow_list_denies_everything() {
    let bridge = assert_ok!(HostBridge::new(
        Policy::new().with_capability(Capability::ExecRun)
    ));
    for command in ["ls", "echo", "true", "/bin/sh"] {
        let err = assert_err!(bridge.exec_run(command, &[], &Deadline::none()).await);
        assert_eq!(err.kind(), ErrorKind::Capability, "command {command}");
    }
}

#[tokio::test]
async fn writes_outside_allowed_paths_are_rejected() {
    let allowed = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let bridge = assert_ok!(HostBridge::new(
        Policy::new()
            .with_capabilities([Capability::FsRead, Capability::FsWrite])
            .allow_path(allowed.path())
    ));

    // Not-yet-existing file outside the allow-list
    let fresh = outside.path().join("new").join("file.txt");
    let err = assert_err!(bridge.fs_write(&fresh, b"x").await);
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(!outside.path().join("new").exists());

    // Symlink inside the allow-list pointing out of it
    #[cfg(unix)]
    {
        let link = allowed.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        let err = assert_err!(bridge.fs_write(link.join("file.txt"), b"x").await);
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(!outside.path().join("file.txt").exists());
    }

    let inside = allowed.path().join("ok.txt");
    assert_ok!(bridge.fs_write(&inside, b"fine").await);
    assert_eq!(assert_ok!(bridge.fs_read(&inside).await), b"fine");
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_and_one_shot_runs_agree() {
    let backend = assert_ok!(WasmBackend::new(Policy::new()));
    assert_ok!(
        backend
            .compile("greeting", GREETING.as_bytes().to_vec())
            .await
    );

    let first = assert_ok!(
        backend
            .execute("greeting", Vec::new(), &Deadline::none())
            .await
    );
    let second = assert_ok!(
        backend
            .execute("greeting", Vec::new(), &Deadline::none())
            .await
    );
    let one_shot = assert_ok!(
        backend
            .execute_bytes(GREETING.as_bytes().to_vec(), Vec::new(), &Deadline::none())
            .await
    );

    assert_eq!(first.stdout, b"deterministic\n");
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.stdout, one_shot.stdout);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_output_is_truncated_exactly() {
    let policy = exec_policy(&["head"]).with_max_output_bytes(1000);
    let config = DockerConfig::default().with_max_output_bytes(1000);

    for backend in backends(policy, config).await {
        let output = assert_ok!(
            backend
                .execute(
                    ExecutionRequest::command("head", &["-c", "5000", "/dev/zero"]),
                    Deadline::none()
                )
                .await
        );
        assert_eq!(output.exit_code, 0, "backend {}", backend.name());
        assert_eq!(output.stdout.len(), 1000, "backend {}", backend.name());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_select_the_bytecode_backend() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    std::io::Write::write_all(
        &mut file,
        br#"
backend = "bytecode"

[policy]
capabilities = ["exec_run"]
allowed_commands = ["echo"]
"#,
    )
    .unwrap();

    let settings = assert_ok!(warden_sandbox::load_settings(Some(file.path())));
    let backend = assert_ok!(warden_sandbox::connect_backend(&settings).await);
    assert_eq!(backend.name(), "bytecode");

    let output = assert_ok!(
        backend
            .execute(ExecutionRequest::command("echo", &["configured"]), Deadline::none())
            .await
    );
    assert_eq!(output.stdout, b"configured\n");
}
