use std::time::Duration;

use wf_harness::sandbox::{CodeSandbox, SandboxOutput};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn runs_script_in_work_dir() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), "hello").unwrap();

    let sandbox = CodeSandbox::new(dir.path());
    let out = sandbox
        .run("```python\nprint(open('data.txt').read())\n```")
        .await
        .unwrap();

    assert_eq!(out, SandboxOutput::Success { stdout: "hello\n".into() });
    assert!(out.render().starts_with("Code executed successfully:"));
}

#[tokio::test]
async fn script_errors_surface_stderr() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = CodeSandbox::new(dir.path())
        .run("d = {}\nd['Revenue']")
        .await
        .unwrap();

    match out {
        SandboxOutput::Failure { stderr, exit_code } => {
            assert!(stderr.contains("KeyError"));
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn long_scripts_time_out() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = CodeSandbox::new(dir.path())
        .with_timeout(Duration::from_millis(300))
        .run("import time\ntime.sleep(10)")
        .await
        .unwrap();

    assert!(matches!(out, SandboxOutput::TimedOut { .. }));
    assert!(!out.is_success());
}
