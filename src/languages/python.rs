use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::sandbox::{Capture, ExecError, Invocation, Mount};
use crate::submission::{Submission, TestCase, TestResult};

use super::{append_output, execute_program, files_with_suffix, run_compile, suite_timeout_result};

/// Optional per-test `lib/` overlay, mounted at /libs
fn lib_overlay(submission: &Submission) -> Option<Mount> {
    let lib_dir = submission.test_dir.join("lib");
    let host = std::fs::canonicalize(&lib_dir).ok()?;
    host.is_dir().then(|| Mount {
        host,
        container: "/libs".to_string(),
        read_only: true,
    })
}

/// Bytecode-compiles every `.py` file in the run dir.
pub async fn compile(ctx: &RunContext, submission: &Submission) -> Result<()> {
    let py_files = files_with_suffix(&submission.run_dir, ".py")?;

    let mut inv = Invocation::new(
        submission.id.clone(),
        &ctx.images.python,
        submission.run_dir.clone(),
    );
    if let Some(libs) = lib_overlay(submission) {
        inv.mounts.push(libs);
    }
    inv.command = ["python3", "-m", "py_compile"].map(String::from).to_vec();
    inv.command.extend(py_files);

    run_compile(inv).await
}

/// Picks the configured entry point, or the sole uploaded `.py` file
fn main_file(submission: &Submission) -> Result<String> {
    if !submission.config.main_name().is_empty() {
        return Ok(submission.config.main_name().to_string());
    }
    let py_files = files_with_suffix(&submission.run_dir, ".py")?;
    match py_files.into_iter().last() {
        Some(name) => Ok(name),
        None => bail!("No Python file found"),
    }
}

pub async fn execute(
    ctx: &RunContext,
    submission: &Submission,
    in_file: &str,
    param_file: &str,
    out_file: &str,
    err_file: &str,
) -> Result<()> {
    let main = main_file(submission)?;
    if !submission.run_dir.join(&main).is_file() {
        bail!("Could not find {main} (rename your program accordingly and try again)");
    }

    let command = vec!["python3".to_string(), main];

    execute_program(
        submission,
        in_file,
        param_file,
        out_file,
        err_file,
        Vec::new(),
        Vec::new(),
        &ctx.images.python,
        command,
    )
    .await
}

/// Pytest suite: run pytest with a JUnit-style XML report and map it.
pub async fn run_pytest_suite(ctx: &RunContext, submission: &Submission) -> TestResult {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(submission.id.clone(), &ctx.images.python, run_dir.clone());
    inv.timeout = Duration::from_secs(submission.config.timeout_s());
    inv.memory_mb = Some(submission.config.mem_mb());
    inv.stdout = Capture::File(run_dir.join("pytest.out.log"));
    inv.stderr = Capture::File(run_dir.join("pytest.err.log"));
    inv.command = [
        "python3",
        "-m",
        "pytest",
        "-o",
        "junit_family=xunit1",
        "-v",
        "--junitxml=./test-result.xml",
        "--doctest-glob=*.md",
        "--doctest-modules",
    ]
    .map(String::from)
    .to_vec();

    match inv.run().await {
        // pytest exits 1 when tests fail; the report decides
        Ok(_) => {}
        Err(ExecError::Timeout) => {
            let message = append_output(run_dir, "pytest.out.log", "pytest.err.log", "Timeout");
            return suite_timeout_result(submission, message);
        }
        Err(e) => {
            return TestResult::internal_error(
                submission,
                format!("Could not execute pytest runner: {e}"),
            );
        }
    }

    let message = append_output(run_dir, "pytest.out.log", "pytest.err.log", "");

    let content = match std::fs::read_to_string(run_dir.join("test-result.xml")) {
        Ok(content) => content,
        Err(_) => {
            let message = append_output(
                run_dir,
                "pytest.out.log",
                "pytest.err.log",
                "Could not find result of unit test execution",
            );
            return TestResult::internal_error(submission, message);
        }
    };
    let doc = match roxmltree::Document::parse(&content) {
        Ok(doc) => doc,
        Err(_) => {
            return TestResult::internal_error(
                submission,
                format!("Could not parse result of pytest execution.\n\n\n{message}"),
            );
        }
    };

    let (tests, tests_failed) = collect_pytest_cases(&doc);

    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests_executed: tests.len(),
        tests_failed,
        tests,
        ..TestResult::default()
    }
}

pub(crate) fn collect_pytest_cases(doc: &roxmltree::Document<'_>) -> (Vec<TestCase>, usize) {
    let mut tests = Vec::new();
    let mut tests_failed = 0;

    for node in doc.descendants().filter(|n| n.has_tag_name("testcase")) {
        let mut error = String::new();
        for failure in node.descendants().filter(|n| n.has_tag_name("failure")) {
            error.push_str(failure.attribute("message").unwrap_or_default());
            error.push_str("\n\n");
            error.push_str(&super::inner_text(failure));
            error.push_str("\n\n");
        }
        for err in node.descendants().filter(|n| n.has_tag_name("error")) {
            error.push_str("\n\n");
            error.push_str(&super::inner_text(err));
            error.push_str("\n\n");
        }

        let success = error.is_empty();
        if !success {
            tests_failed += 1;
        }
        tests.push(TestCase {
            name: node.attribute("name").unwrap_or_default().to_string(),
            success,
            error,
            ..TestCase::default()
        });
    }

    (tests, tests_failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuite errors="0" failures="1" name="pytest" tests="2">
  <testcase classname="test_factorial" name="test_zero" time="0.001"/>
  <testcase classname="test_factorial" name="test_negative" time="0.002">
    <failure message="assert 1 == 0">def test_negative(): ...</failure>
  </testcase>
</testsuite>"#;

    #[test]
    fn maps_pytest_cases_into_the_generic_shape() {
        let doc = roxmltree::Document::parse(REPORT).unwrap();
        let (tests, failed) = collect_pytest_cases(&doc);

        assert_eq!(tests.len(), 2);
        assert_eq!(failed, 1);
        assert_eq!(tests[0].name, "test_zero");
        assert!(tests[0].success);
        assert_eq!(tests[1].name, "test_negative");
        assert!(!tests[1].success);
        assert!(tests[1].error.contains("assert 1 == 0"));
        assert!(tests[1].error.contains("def test_negative"));
    }
}
