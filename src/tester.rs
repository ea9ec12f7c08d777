use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::capped::{read_capped, read_capped_to_string};
use crate::config::{RunContext, TestType};
use crate::languages::{self, files_with_suffix};
use crate::monitoring;
use crate::submission::{Submission, TestCase, TestJob, TestResult};

/// Test-stage handler: run the configured suite, account for it, reply, and
/// clean the run dir when configured to.
pub async fn handle(job: TestJob, ctx: Arc<RunContext>) {
    let TestJob {
        submission,
        reply_test,
    } = job;

    log::info!(
        "executing test suite for submission {} (test {})",
        submission.id,
        submission.test_name
    );

    let started = Instant::now();
    let result = run_suite(&ctx, &submission).await;
    monitoring::TEST_EXECUTION_TIME.observe(started.elapsed().as_secs_f64());
    monitoring::TEST_COUNT
        .with_label_values(&[&submission.test_name])
        .inc_by(result.tests_executed as f64);
    monitoring::TEST_FAIL_COUNT
        .with_label_values(&[&submission.test_name])
        .inc_by(result.tests_failed as f64);

    if reply_test.send(result).is_err() {
        log::warn!("test reply for {} dropped, receiver gone", submission.id);
    }

    if ctx.clean_testruns {
        if let Err(e) = std::fs::remove_dir_all(&submission.run_dir) {
            log::error!("could not delete run dir of {}: {e}", submission.id);
        }
    }
}

/// Dispatches to the runner configured for the test.
pub async fn run_suite(ctx: &RunContext, submission: &Submission) -> TestResult {
    match submission.config.test_type {
        TestType::IoDiff => run_io_diff(ctx, submission).await,
        TestType::Junit => languages::java::run_junit_suite(ctx, submission).await,
        TestType::Xunit => languages::fsharp::run_xunit_suite(ctx, submission).await,
        TestType::Pytest => languages::python::run_pytest_suite(ctx, submission).await,
        TestType::Matlab => languages::matlab::run_matlab_suite(ctx, submission).await,
    }
}

/// Suffix of the expected-output files that define the I/O cases
const EXPECTED_SUFFIX: &str = ".out.txt";

/// I/O-diff runner: one case per expected-output stem in the test dir.
///
/// For stem S the program runs with `S.in.txt` on stdin (optional) and the
/// whitespace-split contents of `S.param.txt` as arguments (optional);
/// stdout and stderr land in `S.out.txt` / `S.err.txt` in the run dir and
/// stdout is diffed against the expected file.
async fn run_io_diff(ctx: &RunContext, submission: &Submission) -> TestResult {
    let test_dir = &submission.test_dir;
    let run_dir = &submission.run_dir;

    let expected_names = match files_with_suffix(test_dir, EXPECTED_SUFFIX) {
        Ok(names) => names,
        Err(_) => return TestResult::internal_error(submission, "Could not read test folder"),
    };

    let mut tests = Vec::new();
    let mut tests_failed = 0;
    let tests_executed = expected_names.len();

    for out_name in &expected_names {
        let stem = &out_name[..out_name.len() - EXPECTED_SUFFIX.len()];
        let in_file = format!("{stem}.in.txt");
        let param_file = format!("{stem}.param.txt");
        let err_file = format!("{stem}.err.txt");
        let expected_path = test_dir.join(out_name);
        let out_path = run_dir.join(out_name);

        let exec_result =
            languages::execute(ctx, submission, &in_file, &param_file, out_name, &err_file).await;

        let in_content = read_capped_to_string(test_dir.join(&in_file))
            .unwrap_or_else(|_| "No input".to_string());
        let parameters = match std::fs::read_to_string(test_dir.join(&param_file)) {
            Ok(params) => format!(" with parameters '{params}'"),
            Err(_) => String::new(),
        };

        let mut case = TestCase {
            name: stem.to_string(),
            error: format!("Error for the following input{parameters}:\n{in_content}"),
            output: read_capped_to_string(&out_path).unwrap_or_default(),
            expected: read_capped_to_string(&expected_path).unwrap_or_default(),
            ..TestCase::default()
        };

        if let Err(e) = exec_result {
            let err_content = read_capped_to_string(run_dir.join(&err_file)).unwrap_or_default();
            case.output.push_str(&format!("\n\n\n{e}\n{err_content}\n"));
            log::debug!("case {stem} of {} failed to execute: {e}", submission.id);
            tests_failed += 1;
            tests.push(case);
            continue;
        }

        match compare_output(ctx, submission, &expected_path, &out_path).await {
            Err(e) => {
                case.output
                    .push_str(&format!("\n\n\nError comparing results:\n{e}\n"));
                tests_failed += 1;
            }
            Ok((rendered_expected, false)) => {
                case.expected = rendered_expected;
                tests_failed += 1;
            }
            Ok((_, true)) => {
                if let Ok(err_content) = read_capped_to_string(run_dir.join(&err_file)) {
                    case.output.push_str(&err_content);
                }
                case.success = true;
                case.error.clear();
            }
        }
        tests.push(case);
    }

    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests,
        tests_executed,
        tests_failed,
        ..TestResult::default()
    }
}

/// Compares actual against expected output.
///
/// Returns the rendered expectation shown to the user on mismatch: the
/// expected file's content for the built-in comparison, or whatever the
/// external compare tool printed.
async fn compare_output(
    ctx: &RunContext,
    submission: &Submission,
    expected_path: &Path,
    out_path: &Path,
) -> Result<(String, bool)> {
    let config = &submission.config;
    let Some(tool) = &config.compare_tool else {
        let expected = read_capped(expected_path)?;
        let output = read_capped(out_path)?;
        if exact_match(&expected, &output) {
            return Ok((String::new(), true));
        }
        return Ok((String::from_utf8_lossy(&expected).into_owned(), false));
    };

    let tool_path = ctx.tools_dir.join(tool);
    let output = tokio::process::Command::new(&tool_path)
        .args(&config.compare_tool_args)
        .arg(expected_path)
        .arg(out_path)
        .output()
        .await?;

    if output.status.success() {
        Ok((String::new(), true))
    } else {
        Ok((String::from_utf8_lossy(&output.stdout).into_owned(), false))
    }
}

/// Byte-exact comparison that tolerates a trailing run of end-of-line bytes
/// on either side; any other difference fails.
fn exact_match(expected: &[u8], output: &[u8]) -> bool {
    if expected.len() != output.len() {
        let (longer, shorter_len) = if output.len() > expected.len() {
            (&output[expected.len()..], expected.len())
        } else {
            (&expected[output.len()..], output.len())
        };
        if !all_end_lines(longer) {
            return false;
        }
        return expected[..shorter_len] == output[..shorter_len];
    }
    expected == output
}

fn all_end_lines(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == b'\n' || b == b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_is_reflexive() {
        assert!(exact_match(b"a\nb", b"a\nb"));
        assert!(exact_match(b"", b""));
    }

    #[test]
    fn trailing_end_of_lines_are_ignored_on_either_side() {
        assert!(exact_match(b"a\nb", b"a\nb\n"));
        assert!(exact_match(b"a\nb\n", b"a\nb"));
        assert!(exact_match(b"a\nb", b"a\nb\r\n\r\n"));
        assert!(exact_match(b"hello\n", b"hello"));
    }

    #[test]
    fn non_eol_trailing_difference_fails() {
        assert!(!exact_match(b"a\nb", b"a\nb "));
        assert!(!exact_match(b"a", b"a x"));
    }

    #[test]
    fn diverging_content_fails() {
        assert!(!exact_match(b"a", b"b"));
        assert!(!exact_match(b"a\nb", b"a\nc"));
    }

    #[test]
    fn eol_bytes_inside_the_content_still_count() {
        // the tolerated run must be strictly trailing
        assert!(!exact_match(b"a\nb", b"a\n\nb"));
    }

    #[test]
    fn all_end_lines_accepts_only_eol_bytes() {
        assert!(all_end_lines(b"\n\r\n"));
        assert!(all_end_lines(b""));
        assert!(!all_end_lines(b"\n \n"));
    }
}
