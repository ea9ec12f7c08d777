use std::time::Duration;

use anyhow::Result;

use crate::config::RunContext;
use crate::monitoring;
use crate::sandbox::{Capture, ExecError, Invocation};
use crate::submission::{Submission, TestCase, TestResult};

use super::{append_output, run_compile, suite_timeout_result};

/// Builds the project in the run dir.
pub async fn compile(ctx: &RunContext, submission: &Submission) -> Result<()> {
    let mut inv = Invocation::new(
        submission.id.clone(),
        &ctx.images.fsharp,
        submission.run_dir.clone(),
    );
    inv.command = ["dotnet", "build"].map(String::from).to_vec();

    run_compile(inv).await
}

/// XUnit suite: stage the test's `.fs` files into the project, build, run
/// `dotnet test` with a trx logger and map the report.
pub async fn run_xunit_suite(ctx: &RunContext, submission: &Submission) -> TestResult {
    let entries = match std::fs::read_dir(&submission.test_dir) {
        Ok(entries) => entries,
        Err(e) => {
            return TestResult::not_compiled(
                &submission.id,
                format!("Could not read test dir\n{e}"),
            );
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) && name.ends_with(".fs") {
            let target = submission.run_dir.join(&name);
            if let Err(e) = std::fs::copy(entry.path(), &target) {
                return TestResult::not_compiled(
                    &submission.id,
                    format!("Could not copy file {name}\n{e}"),
                );
            }
        }
    }

    if let Err(e) = compile(ctx, submission).await {
        monitoring::FRAMEWORK_INCOMPATIBILITY_TOTAL
            .with_label_values(&[&submission.test_name])
            .inc();
        return TestResult::not_compiled(
            &submission.id,
            format!("Error compiling test cases (maybe wrong name of submitted class)\n{e}"),
        );
    }

    execute_xunit(ctx, submission).await
}

async fn execute_xunit(ctx: &RunContext, submission: &Submission) -> TestResult {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(submission.id.clone(), &ctx.images.fsharp, run_dir.clone());
    inv.timeout = Duration::from_secs(submission.config.timeout_s());
    inv.memory_mb = Some(submission.config.mem_mb());
    inv.stdout = Capture::File(run_dir.join("xunit.out.log"));
    inv.stderr = Capture::File(run_dir.join("xunit.err.log"));
    inv.command = [
        "dotnet",
        "test",
        "--blame",
        "-p:ParallelizeTestCollections=false",
        "--logger",
        "trx;LogFileName=Results.trx",
    ]
    .map(String::from)
    .to_vec();

    match inv.run().await {
        // failed tests make `dotnet test` exit non-zero; the report decides
        Ok(_) => {}
        Err(ExecError::Timeout) => {
            let message = append_output(run_dir, "xunit.out.log", "xunit.err.log", "Timeout");
            return suite_timeout_result(submission, message);
        }
        Err(e) => {
            return TestResult::internal_error(
                submission,
                format!("Could not execute XUnit runner: {e}"),
            );
        }
    }

    let message = append_output(run_dir, "xunit.out.log", "xunit.err.log", "");

    // --blame names the test that tore the host down before any report
    if message.contains("while executing following test") {
        return blame_result(submission, message);
    }

    let report_path = run_dir.join("TestResults").join("Results.trx");
    let content = match std::fs::read_to_string(&report_path) {
        Ok(content) => content,
        Err(_) => {
            return TestResult::internal_error(
                submission,
                format!("Could not open Results.trx file.\n\n{message}"),
            );
        }
    };
    let doc = match roxmltree::Document::parse(&content) {
        Ok(doc) => doc,
        Err(_) => {
            return TestResult::internal_error(
                submission,
                format!("Could not parse result of XUnit execution.\n\n\n{message}"),
            );
        }
    };

    match collect_trx_results(&doc) {
        Some((tests, tests_executed, tests_failed)) => TestResult {
            id: submission.id.clone(),
            compiled: true,
            tests_executed,
            tests_failed,
            tests,
            ..TestResult::default()
        },
        None => TestResult::internal_error(submission, "Could not read number of total tests."),
    }
}

/// Renders the single synthetic failure for a crashed test host, naming the
/// offending test when the blame output identifies it.
fn blame_result(submission: &Submission, message: String) -> TestResult {
    let mut test_name = "Test execution".to_string();
    let lines: Vec<&str> = message.lines().collect();
    for i in 0..lines.len().saturating_sub(1) {
        if lines[i].contains("while executing following test") {
            test_name = lines[i + 1].to_string();
        }
    }

    let message = if message.contains("Reason: Process is terminating due to StackOverflowException")
    {
        format!(
            "The tests could not be completed.\n\
             A StackOverflowException usually means the base case of the recursion is never reached.\n\
             \n\n\n{message}"
        )
    } else {
        message
    };

    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests_executed: 1,
        tests_failed: 1,
        tests: vec![TestCase {
            name: test_name,
            success: false,
            error: message,
            ..TestCase::default()
        }],
        ..TestResult::default()
    }
}

/// Maps a trx report: per-test outcome nodes, totals from the result
/// summary, plus any run-level errors as extra failed cases. Returns None
/// when the summary counters are missing or unreadable.
pub(crate) fn collect_trx_results(
    doc: &roxmltree::Document<'_>,
) -> Option<(Vec<TestCase>, usize, usize)> {
    let mut tests = Vec::new();

    for node in doc.descendants().filter(|n| n.tag_name().name() == "UnitTestResult") {
        let mut case = TestCase {
            name: node.attribute("testName").unwrap_or_default().to_string(),
            success: node.attribute("outcome") == Some("Passed"),
            ..TestCase::default()
        };
        if !case.success {
            let mut error = String::new();
            if let Some(msg) = node
                .descendants()
                .find(|n| n.tag_name().name() == "Message")
                .map(super::inner_text)
            {
                error.push_str(&msg);
            }
            if let Some(trace) = node
                .descendants()
                .find(|n| n.tag_name().name() == "StackTrace")
                .map(super::inner_text)
            {
                error.push_str("\n\n");
                error.push_str(&trace);
            }
            case.error = error;
        }
        tests.push(case);
    }

    let counters = doc
        .descendants()
        .find(|n| n.tag_name().name() == "Counters")?;
    let mut tests_executed: usize = counters.attribute("total")?.parse().ok()?;
    let mut tests_failed: usize = counters.attribute("failed")?.parse().ok()?;

    for node in doc.descendants().filter(|n| n.tag_name().name() == "RunInfo") {
        if node.attribute("outcome") == Some("Error") {
            tests.push(TestCase {
                name: "RunInfo".to_string(),
                success: false,
                error: super::inner_text(node),
                ..TestCase::default()
            });
            tests_failed += 1;
            tests_executed += 1;
        }
    }

    Some((tests, tests_executed, tests_failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<TestRun xmlns="http://microsoft.com/schemas/VisualStudio/TeamTest/2010">
  <Results>
    <UnitTestResult testName="Tests.addWorks" outcome="Passed"/>
    <UnitTestResult testName="Tests.subWorks" outcome="Failed">
      <Output>
        <ErrorInfo>
          <Message>Assert.Equal() Failure</Message>
          <StackTrace>at Tests.subWorks()</StackTrace>
        </ErrorInfo>
      </Output>
    </UnitTestResult>
  </Results>
  <ResultSummary outcome="Failed">
    <Counters total="2" executed="2" passed="1" failed="1"/>
    <RunInfos>
      <RunInfo computerName="host" outcome="Error"><Text>host crashed</Text></RunInfo>
    </RunInfos>
  </ResultSummary>
</TestRun>"#;

    #[test]
    fn maps_trx_results_with_summary_totals() {
        let doc = roxmltree::Document::parse(TRX).unwrap();
        let (tests, executed, failed) = collect_trx_results(&doc).unwrap();

        // two unit results plus the run-level error
        assert_eq!(tests.len(), 3);
        assert_eq!(executed, 3);
        assert_eq!(failed, 2);

        assert!(tests[0].success);
        assert!(!tests[1].success);
        assert!(tests[1].error.contains("Assert.Equal() Failure"));
        assert!(tests[1].error.contains("at Tests.subWorks()"));
        assert_eq!(tests[2].name, "RunInfo");
        assert!(tests[2].error.contains("host crashed"));
    }

    #[test]
    fn missing_summary_is_reported() {
        let doc = roxmltree::Document::parse("<TestRun><Results/></TestRun>").unwrap();
        assert!(collect_trx_results(&doc).is_none());
    }

    #[test]
    fn blame_output_names_the_offending_test() {
        let submission = crate::submission::Submission {
            id: "abc".to_string(),
            run_dir: std::path::PathBuf::from("/tmp/run"),
            test_dir: std::path::PathBuf::from("/tmp/test"),
            test_name: "t".to_string(),
            config: crate::config::TestConfig::default(),
        };
        let message = "The active test run was aborted. Reason: Process is terminating due to StackOverflowException.\nwhile executing following test:\nTests.recursesForever\n".to_string();
        let result = blame_result(&submission, message);

        assert_eq!(result.tests_executed, 1);
        assert_eq!(result.tests_failed, 1);
        assert_eq!(result.tests[0].name, "Tests.recursesForever");
        assert!(result.tests[0].error.contains("base case of the recursion"));
    }
}
