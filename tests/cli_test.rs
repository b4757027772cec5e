//! CLI integration tests for vmcloak
//!
//! These tests exercise argument handling and the config-error paths, none
//! of which need a hypervisor.
//! Run with: cargo test --test cli_test

use std::process::Command;

/// Run vmcloak with given args and return (exit_code, stdout, stderr)
fn run_cmd(args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_vmcloak"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command");

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    (exit_code, stdout, stderr)
}

// === Help and Version Tests ===

#[test]
fn test_help() {
    let (exit_code, stdout, _stderr) = run_cmd(&["--help"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("randomized"));
    assert!(stdout.contains("--basedir"));
    assert!(stdout.contains("--iso"));
    assert!(stdout.contains("--list"));
    assert!(stdout.contains("--delete"));
}

#[test]
fn test_version() {
    let (exit_code, stdout, _stderr) = run_cmd(&["--version"]);
    assert_eq!(exit_code, 0);
    assert!(stdout.contains("vmcloak"));
}

// === Argument Errors ===

#[test]
fn test_missing_vm_name() {
    let (exit_code, _stdout, stderr) = run_cmd(&[]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("VMNAME") || stderr.contains("vmname"));
}

#[test]
fn test_list_conflicts_with_delete() {
    let (exit_code, _stdout, stderr) =
        run_cmd(&["cuckoo1", "--basedir", "/tmp", "--list", "--delete"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("cannot be used with"));
}

#[test]
fn test_hwvirt_conflicts_with_no_hwvirt() {
    let (exit_code, _stdout, _stderr) =
        run_cmd(&["cuckoo1", "--basedir", "/tmp", "--hwvirt", "--no-hwvirt"]);
    assert_ne!(exit_code, 0);
}

// === Config Errors ===

#[test]
fn test_missing_basedir() {
    let (exit_code, _stdout, stderr) = run_cmd(&["cuckoo1"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("--basedir"));
}

#[test]
fn test_missing_iso() {
    let dir = tempfile::tempdir().unwrap();
    let basedir = dir.path().to_str().unwrap();

    let (exit_code, _stdout, stderr) = run_cmd(&["cuckoo1", "--basedir", basedir]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("--iso"));
    // Nothing was created under the base directory
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_invalid_vm_name() {
    let (exit_code, _stdout, stderr) = run_cmd(&["bad;name", "--basedir", "/tmp"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("invalid character"));
}

#[test]
fn test_unknown_backend() {
    let (exit_code, _stdout, stderr) =
        run_cmd(&["cuckoo1", "--basedir", "/tmp", "--vm", "vmware"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("vmware"));
}

#[test]
fn test_invalid_ramsize() {
    let (exit_code, _stdout, stderr) =
        run_cmd(&["cuckoo1", "--basedir", "/tmp", "--ramsize", "0"]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("RAM size"));
}

#[test]
fn test_missing_vboxmanage_path() {
    let (exit_code, _stdout, stderr) = run_cmd(&[
        "cuckoo1",
        "--basedir",
        "/tmp",
        "--vboxmanage",
        "/nonexistent/VBoxManage",
        "--list",
    ]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("VBoxManage path does not exist"));
}

#[test]
fn test_settings_file_supplies_basedir() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("vmcloak.toml");
    std::fs::write(
        &settings,
        format!("basedir = \"{}\"\n", dir.path().join("vms").display()),
    )
    .unwrap();

    // basedir comes from the file, so the failure is the missing ISO
    let (exit_code, _stdout, stderr) =
        run_cmd(&["cuckoo1", "-s", settings.to_str().unwrap()]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("--iso"));
}

#[test]
fn test_settings_file_rejects_unknown_keys() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("vmcloak.toml");
    std::fs::write(&settings, "basedir = \"/tmp\"\nbogus = 1\n").unwrap();

    let (exit_code, _stdout, _stderr) =
        run_cmd(&["cuckoo1", "-s", settings.to_str().unwrap()]);
    assert_ne!(exit_code, 0);
}

// === Backend Errors ===

#[cfg(unix)]
#[test]
fn test_delete_with_failing_vboxmanage() {
    if !std::path::Path::new("/bin/false").exists() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
    let basedir = dir.path().to_str().unwrap();

    let (exit_code, _stdout, stderr) = run_cmd(&[
        "cuckoo1",
        "--basedir",
        basedir,
        "--vboxmanage",
        "/bin/false",
        "--delete",
    ]);
    assert_ne!(exit_code, 0);
    assert!(stderr.contains("Error"));
    assert!(dir.path().join("keep.txt").exists());
}
