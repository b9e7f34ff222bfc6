//! Links a plain C program against `libsiderail_rt.a` and drives it.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use siderail_cli::config::ShowmapConfig;
use siderail_cli::executor::{ExecutionStatus, ForkServerExecutor};
use siderail_core::BranchState;
use siderail_core::cmp::branch_slot;
use tempfile::TempDir;

const BR_FIRST_BYTE: i32 = 0x200;
const BR_MAGIC: i32 = 0x201;

fn runtime_archive() -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let uplifted = deps.parent().unwrap().join("libsiderail_rt.a");
    if uplifted.exists() {
        return uplifted;
    }
    std::fs::read_dir(deps)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("libsiderail_rt") && name.ends_with(".a"))
        })
        .expect("libsiderail_rt.a should sit next to the test binary")
}

fn build_target() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("c_target");
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/c/target.c");
    let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    // Deliberately no --whole-archive: the hooks alone must drag the constructor in.
    let output = Command::new(&cc)
        .arg(&source)
        .arg(runtime_archive())
        .arg("-o")
        .arg(&out)
        .args(["-lgcc_s", "-lutil", "-lrt", "-lpthread", "-lm", "-ldl"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "Linking the C target failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    (dir, out)
}

fn target() -> &'static Path {
    static TARGET: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    &TARGET.get_or_init(build_target).1
}

fn config() -> ShowmapConfig {
    let mut config = ShowmapConfig::for_command(vec![target().display().to_string()]);
    config.executor.timeout_ms = 2000;
    config
}

fn state_at(area: &[u8], br_id: i32) -> Option<BranchState> {
    BranchState::from_byte(area[branch_slot(br_id)])
}

#[test]
fn plain_link_starts_the_fork_server() {
    let mut executor = ForkServerExecutor::spawn(&config())
        .expect("The constructor must send the hello frame without --whole-archive");

    let run = executor.run(b"magic").unwrap();
    assert_eq!(run.status, ExecutionStatus::Ok);
    let area = executor.map();
    assert_eq!(area[0], 1, "Attached map carries the liveness marker");
    assert_eq!(state_at(area, BR_FIRST_BYTE), Some(BranchState::OnlyFalse));
    assert_eq!(state_at(area, BR_MAGIC), Some(BranchState::OnlyTrue));
    let nonzero = area.iter().filter(|&&b| b != 0).count();
    assert!(nonzero >= 4, "Marker, guard and both branches, got {nonzero} slots");

    let run = executor.run(b"Abc").unwrap();
    assert_eq!(run.status, ExecutionStatus::Ok);
    assert_eq!(state_at(executor.map(), BR_FIRST_BYTE), Some(BranchState::OnlyTrue));
    assert_eq!(state_at(executor.map(), BR_MAGIC), Some(BranchState::OnlyFalse));
}

#[test]
fn persistent_loop_keeps_one_c_child() {
    let mut config = config();
    config.runtime.persistent = true;
    let mut executor = ForkServerExecutor::spawn(&config).unwrap();

    let first = executor.run(b"magic").unwrap();
    let second = executor.run(b"Abc").unwrap();
    assert_eq!(first.status, ExecutionStatus::Ok);
    assert_eq!(second.status, ExecutionStatus::Ok);
    assert_eq!(first.pid, second.pid, "__afl_persistent_loop must stop and resume the child");
    assert_eq!(state_at(executor.map(), BR_FIRST_BYTE), Some(BranchState::OnlyTrue));
}

#[test]
fn check_hooks_report_operands() {
    let mut config = config();
    config.runtime.extra_env = BTreeMap::from([("TARGET_EXTRACT".to_string(), "1".to_string())]);
    let mut executor = ForkServerExecutor::spawn(&config).unwrap();

    let (run, capture) = executor.run_extract(b"Zed", BR_FIRST_BYTE).unwrap();
    assert_eq!(run.status, ExecutionStatus::Ok);
    let capture = capture.expect("check_br32 should fill the record");
    assert_eq!((capture.op1, capture.op2), (i32::from(b'Z'), i32::from(b'A')));

    let (_, capture) = executor.run_extract(b"magic", BR_MAGIC).unwrap();
    let capture = capture.expect("check_strcmp should fill the record");
    assert_eq!((capture.op1, capture.op2), (i32::from(b'm'), i32::from(b'm')));
}

fn run_standalone(env: &[(&str, &str)]) -> std::process::Output {
    Command::new(target())
        .env_remove("__AFL_SHM_ID")
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .unwrap()
}

#[test]
fn standalone_run_without_driver_succeeds() {
    let output = run_standalone(&[]);
    assert!(output.status.success(), "standalone run failed: {:?}", output.status);
}

#[test]
fn out_of_range_ratio_aborts_with_diagnostic() {
    for ratio in ["0", "101"] {
        let output = run_standalone(&[("AFL_INST_RATIO", ratio)]);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(
            output.status.signal(),
            Some(libc::SIGABRT),
            "AFL_INST_RATIO={ratio} must abort, got {:?}",
            output.status
        );
        assert!(
            stderr.contains(&format!("Invalid AFL_INST_RATIO \"{ratio}\"")),
            "Missing diagnostic for ratio {ratio}: {stderr}"
        );
    }
}

#[test]
fn malformed_shm_id_exits_with_diagnostic() {
    let output = run_standalone(&[("__AFL_SHM_ID", "bogus")]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "got {:?}", output.status);
    assert!(stderr.contains("Invalid __AFL_SHM_ID \"bogus\""), "stderr: {stderr}");
}
