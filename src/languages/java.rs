use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::monitoring;
use crate::sandbox::{Capture, ExecError, Invocation, Mount};
use crate::submission::{Submission, TestCase, TestResult};

use super::{
    append_output, execute_program, files_with_suffix, files_with_suffix_recursive, inner_text,
    run_compile, suite_timeout_result,
};

/// Pinned unit-test runner, mounted read-only into every Java sandbox
pub const JUNIT_STANDALONE_JAR: &str = "junit-platform-console-standalone-1.5.0-M1.jar";

fn junit_jar_mount(ctx: &RunContext) -> Mount {
    Mount {
        host: ctx.base_dir.join(JUNIT_STANDALONE_JAR),
        container: format!("/jars/{JUNIT_STANDALONE_JAR}"),
        read_only: true,
    }
}

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

/// Compiles every `.java` file below the run dir. The classpath holds the
/// run dir itself, the pinned JUnit jar, and the test's `lib/` overlay when
/// one exists.
pub async fn compile(ctx: &RunContext, submission: &Submission) -> Result<()> {
    let mut classpath = vec![".".to_string(), format!("/jars/{JUNIT_STANDALONE_JAR}")];

    let mut inv = Invocation::new(
        submission.id.clone(),
        &ctx.images.java,
        submission.run_dir.clone(),
    );
    inv.mounts.push(junit_jar_mount(ctx));
    if let Some(libs) = lib_overlay(submission) {
        inv.mounts.push(libs);
        classpath.push("/libs/*".to_string());
    }

    let java_files = files_with_suffix_recursive(&submission.run_dir, ".java");

    inv.command = vec![
        "javac".to_string(),
        "-d".to_string(),
        ".".to_string(),
        "-cp".to_string(),
        classpath.join(":"),
        "-encoding".to_string(),
        "utf-8".to_string(),
    ];
    inv.command.extend(java_files);

    run_compile(inv).await
}

pub async fn execute(
    ctx: &RunContext,
    submission: &Submission,
    in_file: &str,
    param_file: &str,
    out_file: &str,
    err_file: &str,
) -> Result<()> {
    let main = submission.config.main_name();
    let main_class = submission.run_dir.join(format!("{main}.class"));
    if !main_class.is_file() {
        bail!("Could not find {main}.java (rename your program accordingly and try again)");
    }

    let mut classpath = vec![".".to_string()];
    let mut mounts = vec![junit_jar_mount(ctx)];
    if let Some(libs) = lib_overlay(submission) {
        mounts.push(libs);
        classpath.push("/libs/*".to_string());
    }

    let command = vec![
        "java".to_string(),
        "-cp".to_string(),
        classpath.join(":"),
        format!("-Xmx{}m", submission.config.mem_mb()),
        main.to_string(),
    ];

    execute_program(
        submission,
        in_file,
        param_file,
        out_file,
        err_file,
        mounts,
        Vec::new(),
        &ctx.images.java,
        command,
    )
    .await
}

/// JUnit suite: stage the test sources next to the user code, compile them
/// together, then run the console launcher and map its XML reports.
pub async fn run_junit_suite(ctx: &RunContext, submission: &Submission) -> TestResult {
    let entries = match std::fs::read_dir(&submission.test_dir) {
        Ok(entries) => entries,
        Err(_) => return TestResult::internal_error(submission, "Could not read test dir"),
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let target = submission.run_dir.join(entry.file_name());
            if let Err(e) = std::fs::copy(entry.path(), &target) {
                log::warn!("could not stage test file {:?}: {e}", entry.file_name());
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

    // only class files stay in the workspace for the run
    if let Ok(names) = files_with_suffix(&submission.run_dir, ".java") {
        for name in names {
            let _ = std::fs::remove_file(submission.run_dir.join(name));
        }
    }

    execute_junit(ctx, submission).await
}

async fn execute_junit(ctx: &RunContext, submission: &Submission) -> TestResult {
    let run_dir = &submission.run_dir;

    let mut inv = Invocation::new(submission.id.clone(), &ctx.images.java, run_dir.clone());
    inv.timeout = Duration::from_secs(submission.config.timeout_s());
    inv.memory_mb = Some(submission.config.mem_mb());
    inv.mounts.push(junit_jar_mount(ctx));
    if let Some(libs) = lib_overlay(submission) {
        inv.mounts.push(libs);
    }
    inv.stdout = Capture::File(run_dir.join("junit.out.log"));
    inv.stderr = Capture::File(run_dir.join("junit.err.log"));
    inv.command = [
        "java",
        "-jar",
        &format!("/jars/{JUNIT_STANDALONE_JAR}"),
        "-cp",
        ".",
        "--scan-classpath=.",
        "--reports-dir=reports",
        "--config=junit.platform.output.capture.stderr=true",
        "--config=junit.platform.output.capture.stdout=true",
    ]
    .map(String::from)
    .to_vec();

    match inv.run().await {
        // failed tests make the launcher exit non-zero; the report decides
        Ok(_) => {}
        Err(ExecError::Timeout) => {
            let message = append_output(run_dir, "junit.out.log", "junit.err.log", "Timeout");
            return suite_timeout_result(submission, message);
        }
        Err(e) => {
            return TestResult::internal_error(
                submission,
                format!("Could not execute JUnit runner: {e}"),
            );
        }
    }

    let message = append_output(run_dir, "junit.out.log", "junit.err.log", "");

    let mut tests = Vec::new();
    let mut failure_count = 0;
    for report in ["TEST-junit-jupiter.xml", "TEST-junit-vintage.xml"] {
        let path = run_dir.join("reports").join(report);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                return TestResult::internal_error(
                    submission,
                    format!("Could not parse result of JUnit execution.\n\n\n{message}"),
                );
            }
        };
        let doc = match roxmltree::Document::parse(&content) {
            Ok(doc) => doc,
            Err(_) => {
                return TestResult::internal_error(
                    submission,
                    format!("Could not parse result of JUnit execution.\n\n\n{message}"),
                );
            }
        };
        collect_junit_cases(&doc, &mut failure_count, &mut tests);
    }

    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests_executed: tests.len(),
        tests_failed: failure_count,
        tests,
        ..TestResult::default()
    }
}

/// Maps `testcase` nodes of a JUnit XML report into the generic shape:
/// name is `classname.name`, success means no failure or error child, and
/// the error text concatenates errors, failures and captured output.
pub(crate) fn collect_junit_cases(
    doc: &roxmltree::Document<'_>,
    failure_count: &mut usize,
    tests: &mut Vec<TestCase>,
) {
    for node in doc.descendants().filter(|n| n.has_tag_name("testcase")) {
        let failures: Vec<_> = node
            .children()
            .filter(|c| c.has_tag_name("failure"))
            .collect();
        let errors: Vec<_> = node.children().filter(|c| c.has_tag_name("error")).collect();

        let mut case = TestCase {
            name: format!(
                "{}.{}",
                node.attribute("classname").unwrap_or_default(),
                node.attribute("name").unwrap_or_default()
            ),
            success: failures.is_empty() && errors.is_empty(),
            ..TestCase::default()
        };

        if !case.success {
            *failure_count += 1;
            let mut error = String::new();
            for n in &errors {
                error.push_str(&inner_text(*n));
            }
            for n in &failures {
                error.push_str(&inner_text(*n));
            }
            // the first system-out block repeats the launcher banner
            for (i, n) in node
                .children()
                .filter(|c| c.has_tag_name("system-out"))
                .enumerate()
            {
                if i > 0 {
                    error.push_str(&inner_text(n));
                }
            }
            for n in node.children().filter(|c| c.has_tag_name("system-err")) {
                error.push_str(&inner_text(n));
            }
            case.error = error;
        }

        tests.push(case);
    }
}
