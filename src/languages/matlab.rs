use std::time::Duration;

use crate::capped::read_capped_to_string;
use crate::config::RunContext;
use crate::sandbox::{Capture, ExecError, Invocation};
use crate::submission::{Submission, TestCase, TestResult};

use super::{append_output, suite_timeout_result};

/// Matlab suite: run the configured test function headless and judge the
/// printed verdict. There is no compile step; syntax errors surface here.
pub async fn run_matlab_suite(ctx: &RunContext, submission: &Submission) -> TestResult {
    let run_dir = &submission.run_dir;
    let main = submission.config.main_name();

    let mut inv = Invocation::new(submission.id.clone(), &ctx.images.matlab, run_dir.clone());
    inv.timeout = Duration::from_secs(submission.config.timeout_s());
    inv.memory_mb = Some(submission.config.mem_mb());
    inv.stdout = Capture::File(run_dir.join("matlab.out.log"));
    inv.stderr = Capture::File(run_dir.join("matlab.err.log"));
    inv.command = vec![
        "/usr/local/MATLAB/R2018b/bin/matlab".to_string(),
        "-nodisplay".to_string(),
        "-sd".to_string(),
        "/code".to_string(),
        "-r".to_string(),
        format!("disp({main});exit"),
    ];

    match inv.run().await {
        Err(ExecError::Timeout) => {
            let message = append_output(run_dir, "matlab.out.log", "matlab.err.log", "Timeout");
            return suite_timeout_result(submission, message);
        }
        Err(e) => {
            return TestResult::internal_error(
                submission,
                format!("Could not execute Matlab runner: {e}"),
            );
        }
        Ok(out) if !out.status.success() => {
            let message = append_output(
                run_dir,
                "matlab.out.log",
                "matlab.err.log",
                &format!("Failed with exit code {}", out.status.code().unwrap_or(-1)),
            );
            return suite_timeout_result(submission, message);
        }
        Ok(_) => {}
    }

    let stderr = read_capped_to_string(run_dir.join("matlab.err.log")).unwrap_or_default();
    let message = append_output(run_dir, "matlab.out.log", "matlab.err.log", "");

    // the test function prints its verdict as the third-to-last line
    let lines: Vec<&str> = message.split('\n').collect();
    let mut tests_failed = match lines.len().checked_sub(3).and_then(|i| lines.get(i)) {
        Some(line) if line.contains('1') => 0,
        _ => 1,
    };
    if !stderr.is_empty() {
        tests_failed = 1;
    }

    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests_executed: 1,
        tests_failed,
        tests: vec![TestCase {
            name: main.to_string(),
            success: tests_failed == 0,
            error: extract_message(&message),
            ..TestCase::default()
        }],
        ..TestResult::default()
    }
}

/// The test function frames its report between separator rows; strip the
/// surrounding Matlab chatter when both markers are present.
fn extract_message(s: &str) -> String {
    const SEP: &str = "###############";
    if let (Some(first), Some(last)) = (s.find(SEP), s.rfind(SEP)) {
        if last > first {
            return s[first + SEP.len()..last].to_string();
        }
    }
    s.to_string()
}
