use std::net::TcpListener;
use std::process::Command;

fn forwarder() -> Command {
    Command::new(env!("CARGO_BIN_EXE_traffic-forwarder"))
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn ssl_without_cert_exits_with_one_before_binding() {
    let port = free_port();
    let output = forwarder()
        .args(["--ssl", "-H", "127.0.0.1", "-p", &port.to_string()])
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let logs = String::from_utf8_lossy(&output.stdout);
    assert!(logs.contains("certificate missing"), "{logs}");

    // The port was never taken.
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[test]
fn unreadable_certificate_exits_with_one() {
    let output = forwarder()
        .args(["--ssl", "--cert", "/nonexistent/forwarder.pem", "-p", "0"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn help_lists_forwarding_flags() {
    let output = forwarder().arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for flag in ["--host", "--port", "--target", "--target-port", "--ssl", "--cert", "--target-ssl"] {
        assert!(help.contains(flag), "missing {flag} in:\n{help}");
    }
}
