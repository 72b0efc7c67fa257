use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn gateway_bin() -> String {
    std::env::var("CARGO_BIN_EXE_mqtt-gateway").unwrap_or_else(|_| {
        let current = std::env::current_exe().expect("current exe");
        let debug_dir = current
            .parent()
            .and_then(|p| p.parent())
            .expect("target debug dir");
        debug_dir
            .join("mqtt-gateway")
            .to_string_lossy()
            .to_string()
    })
}

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("local addr")
}

fn spawn_gateway(bind: SocketAddr, liveness_disabled: bool) -> std::process::Child {
    let mut cmd = Command::new(gateway_bin());
    cmd.env("MQTT_GATEWAY_BIND", bind.to_string())
        .env("MQTT_GATEWAY_METRICS_BIND", "127.0.0.1:0")
        .env("MQTT_GATEWAY_STORAGE_BACKEND", "memory")
        .env(
            "MQTT_GATEWAY_LIVENESS_DISABLED",
            if liveness_disabled { "true" } else { "false" },
        )
        .env("REDIS_HOST", "127.0.0.1")
        .env("REDIS_PORT", "1")
        .env_remove("CLUSTER_MODE")
        .env_remove("MQTT_GATEWAY_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.spawn().expect("spawn gateway")
}

fn stop_with_sigint(child: &mut std::process::Child) {
    let pid = child.id().to_string();
    let status = Command::new("kill")
        .arg("-INT")
        .arg(pid)
        .status()
        .expect("send SIGINT");
    assert!(status.success());
}

fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if Instant::now() >= deadline {
            child.kill().expect("kill on timeout");
            return child.wait().expect("wait after kill");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Issue `GET /api/health/status` and return the status line.
fn health_status_line(addr: SocketAddr) -> Option<String> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(mut stream) = TcpStream::connect(addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("read timeout");
            let request = format!(
                "GET /api/health/status HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).expect("write");
            let mut response = String::new();
            let _ = stream.read_to_string(&mut response);
            return response.lines().next().map(str::to_string);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn binary_serves_health_and_stops_on_sigint() {
    let addr = free_addr();
    let mut child = spawn_gateway(addr, true);
    let status_line = health_status_line(addr).expect("gateway listening");
    assert!(status_line.contains("200"), "{status_line}");
    stop_with_sigint(&mut child);
    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(status.success());
}

#[test]
fn binary_rejects_requests_when_cache_is_unreachable() {
    let addr = free_addr();
    let mut child = spawn_gateway(addr, false);
    let status_line = health_status_line(addr).expect("gateway listening");
    assert!(status_line.contains("500"), "{status_line}");
    stop_with_sigint(&mut child);
    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(status.success());
}
