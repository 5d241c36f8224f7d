use super::*;
use crate::deadline::Deadline;
use crate::error::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};

fn bridge(policy: Policy) -> HostBridge {
    HostBridge::new(policy).unwrap()
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Serve exactly one HTTP response with `body`, returning the base URL
pub(crate) async fn serve_once(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Capability gating

#[tokio::test]
async fn test_missing_capabilities_have_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("created.txt");
    let bridge = bridge(
        Policy::new()
            .allow_path(dir.path())
            .allow_command("touch"),
    );

    let err = bridge.fs_write(&target, b"data").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(
        err.to_string(),
        "capability: operation \"fs_write\" requires capability \"fs_write\""
    );
    assert!(!target.exists());

    let err = bridge.fs_read(&target).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);

    let touched = dir.path().join("touched");
    let err = bridge
        .exec_run("touch", &args(&[touched.to_str().unwrap()]), &Deadline::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(!touched.exists());

    let err = bridge
        .http_fetch("GET", "http://127.0.0.1:1/", None, &[], &Deadline::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(err.to_string().contains("net_http"));
}

// ---------------------------------------------------------------------------
// Filesystem

#[tokio::test]
async fn test_fs_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(
        Policy::new()
            .with_capabilities([Capability::FsRead, Capability::FsWrite])
            .allow_path(dir.path()),
    );

    let path = dir.path().join("nested/deeper/file.txt");
    assert_ok!(bridge.fs_write(&path, b"hello").await);
    assert_eq!(bridge.fs_read(&path).await.unwrap(), b"hello");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_fs_outside_allowed_is_denied_before_io() {
    let allowed = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let bridge = bridge(
        Policy::new()
            .with_capabilities([Capability::FsRead, Capability::FsWrite])
            .allow_path(allowed.path()),
    );

    let target = other.path().join("new-dir/escape.txt");
    let err = bridge.fs_write(&target, b"x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(err.to_string().contains("outside allowed directories"));
    assert!(!other.path().join("new-dir").exists());

    assert_err!(bridge.fs_read("/etc/hostname").await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_fs_write_through_dangling_symlink_is_denied() {
    let allowed = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let victim = outside.path().join("planted.txt");
    let link = allowed.path().join("link");
    std::os::unix::fs::symlink(&victim, &link).unwrap();

    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::FsWrite)
            .allow_path(allowed.path()),
    );
    let err = bridge.fs_write(&link, b"pwned").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(!victim.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_fs_write_through_dangling_symlink_inside_allowed() {
    let allowed = tempfile::tempdir().unwrap();
    let link = allowed.path().join("link");
    std::os::unix::fs::symlink("real.txt", &link).unwrap();

    let bridge = bridge(
        Policy::new()
            .with_capabilities([Capability::FsRead, Capability::FsWrite])
            .allow_path(allowed.path()),
    );
    assert_ok!(bridge.fs_write(&link, b"kept").await);
    assert_eq!(
        std::fs::read(allowed.path().join("real.txt")).unwrap(),
        b"kept"
    );
    assert_eq!(bridge.fs_read(&link).await.unwrap(), b"kept");
}

#[tokio::test]
async fn test_fs_read_truncates_to_output_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![b'a'; 4096]).unwrap();

    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::FsRead)
            .allow_path(dir.path())
            .with_max_output_bytes(100),
    );
    let data = bridge.fs_read(&path).await.unwrap();
    assert_eq!(data.len(), 100);
}

#[tokio::test]
async fn test_working_dir_confines_when_no_allowed_paths() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::FsWrite)
            .with_working_dir(dir.path()),
    );

    assert_ok!(bridge.fs_write("relative.txt", b"ok").await);
    assert!(dir.path().join("relative.txt").exists());
    assert_err!(bridge.fs_write("../escape.txt", b"no").await);
}

// ---------------------------------------------------------------------------
// Exec

#[tokio::test]
async fn test_empty_command_allow_list_denies_everything() {
    let bridge = bridge(Policy::new().with_capability(Capability::ExecRun));
    for command in ["ls", "echo", "/bin/true"] {
        let err = bridge
            .exec_run(command, &[], &Deadline::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
        assert!(err.to_string().contains("AllowedCommands is empty"));
    }
}

#[test]
fn test_validate_command_matching() {
    let bridge = bridge(Policy::new().allow_command("echo").allow_command("/usr/bin/env"));
    assert_ok!(bridge.validate_command("echo"));
    assert_ok!(bridge.validate_command("/bin/echo"));
    assert_ok!(bridge.validate_command("/usr/bin/env"));

    let err = bridge.validate_command("ls").unwrap_err();
    assert_eq!(
        err.to_string(),
        "capability: command \"ls\" is not in allowed list"
    );
    assert_err!(bridge.validate_command("echo2"));
}

#[tokio::test]
async fn test_exec_echo_hello_world() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("echo"),
    );
    let output = bridge
        .exec_run("echo", &args(&["hello", "world"]), &Deadline::none())
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, b"hello world\n");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn test_exec_nonzero_exit_is_not_an_error() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("sh"),
    );
    let output = bridge
        .exec_run("sh", &args(&["-c", "echo oops >&2; exit 42"]), &Deadline::none())
        .await
        .unwrap();
    assert_eq!(output.exit_code, 42);
    assert_eq!(output.stderr, b"oops\n");
}

#[tokio::test]
async fn test_exec_timeout_keeps_partial_output() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("sh")
            .with_timeout(Duration::from_millis(500)),
    );
    let started = std::time::Instant::now();
    let err = bridge
        .exec_run("sh", &args(&["-c", "echo started; exec sleep 10"]), &Deadline::none())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    let partial = err.partial_output().unwrap();
    assert_eq!(partial.stdout, b"started\n");
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_exec_output_capped() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("head")
            .with_max_output_bytes(64),
    );
    let output = bridge
        .exec_run("head", &args(&["-c", "10000", "/dev/zero"]), &Deadline::none())
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout.len(), 64);
}

#[tokio::test]
async fn test_exec_spawn_failure_is_runtime() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("definitely-not-a-real-binary-xyz"),
    );
    let err = bridge
        .exec_run("definitely-not-a-real-binary-xyz", &[], &Deadline::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
}

#[tokio::test]
async fn test_execute_command_with_stdin() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::ExecRun)
            .allow_command("cat"),
    );
    let output = bridge
        .execute_command("cat", &[], Some(b"piped".to_vec()), &Deadline::none())
        .await
        .unwrap();
    assert!(output.is_success());
    assert_eq!(output.stdout, b"piped");
}

// ---------------------------------------------------------------------------
// HTTP

#[tokio::test]
async fn test_http_fetch_allowed_host() {
    let base = serve_once("pong").await;
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::NetHttp)
            .allow_host("127.0.0.1"),
    );
    let response = bridge
        .http_fetch("get", &format!("{base}/ping"), None, &[], &Deadline::none())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"pong");
}

#[tokio::test]
async fn test_http_fetch_rejects_unlisted_host() {
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::NetHttp)
            .allow_host("api.example.com"),
    );
    let err = bridge
        .http_fetch("GET", "http://127.0.0.1:9/ping", None, &[], &Deadline::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(
        err.to_string(),
        "capability: host not in allowed list for URL: http://127.0.0.1:9/ping"
    );
}

#[tokio::test]
async fn test_http_fetch_body_capped() {
    let base = serve_once("0123456789abcdef").await;
    let bridge = bridge(
        Policy::new()
            .with_capability(Capability::NetHttp)
            .with_max_output_bytes(10),
    );
    let response = bridge
        .http_fetch("GET", &base, None, &[], &Deadline::none())
        .await
        .unwrap();
    assert_eq!(response.body, b"0123456789");
}

#[test]
fn test_validate_url_is_substring_match() {
    let bridge = bridge(Policy::new().allow_host("example.com"));
    assert_ok!(bridge.validate_url("https://example.com/a"));
    // Coarse by construction: the host string may appear anywhere in the URL
    assert_ok!(bridge.validate_url("https://evil.test/?next=example.com"));
    assert_err!(bridge.validate_url("https://example.org/"));
}
