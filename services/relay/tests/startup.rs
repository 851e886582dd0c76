//! Process-level startup behavior of the `relay` binary.

use std::net::TcpListener;
use std::process::Command;

fn relay() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_relay"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn bind_failure_exits_non_zero() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port().to_string();

    let status = relay()
        .args(["--bind-host", "127.0.0.1", "--bind-port", &port])
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn invalid_configuration_exits_non_zero() {
    let status = relay()
        .args(["--bind-host", "127.0.0.1", "--bind-port", "0", "--remote-port", "0"])
        .status()
        .unwrap();
    assert!(!status.success());
}
