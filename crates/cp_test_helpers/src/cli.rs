//! CLI command builders for tests

use assert_cmd::Command;

/// `classpoints` binary with `RUST_LOG=error` and no user overrides
#[allow(deprecated)]
pub fn classpoints_command() -> Command {
    command_for("classpoints")
}

#[allow(deprecated)]
pub fn command_for(bin_name: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin_name)
        .unwrap_or_else(|_| panic!("Failed to find {} binary", bin_name));
    cmd.env("RUST_LOG", "error");
    cmd.env_remove("CLASSPOINTS_WORKSPACE");
    cmd
}
