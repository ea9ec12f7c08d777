pub mod c;
pub mod fsharp;
pub mod java;
pub mod matlab;
pub mod python;

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::capped::read_capped_to_string;
use crate::config::{Compiler, RunContext};
use crate::monitoring;
use crate::sandbox::{Capture, ExecError, Invocation, Mount};
use crate::submission::{Submission, TestCase, TestResult};

/// Wall-clock deadline for compiler invocations. The submission's own
/// limits apply to test execution, not to the toolchain.
pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Compiles the submission with the driver for its configured language.
pub async fn compile(ctx: &RunContext, submission: &Submission) -> Result<()> {
    match submission.config.compiler {
        Compiler::Java => java::compile(ctx, submission).await,
        Compiler::C => c::compile(ctx, submission).await,
        Compiler::Fsharp => fsharp::compile(ctx, submission).await,
        Compiler::Python => python::compile(ctx, submission).await,
        // syntax is checked at run time
        Compiler::Matlab => Ok(()),
    }
}

/// Runs the compiled program for one I/O test case.
pub async fn execute(
    ctx: &RunContext,
    submission: &Submission,
    in_file: &str,
    param_file: &str,
    out_file: &str,
    err_file: &str,
) -> Result<()> {
    match submission.config.compiler {
        Compiler::Java => java::execute(ctx, submission, in_file, param_file, out_file, err_file).await,
        Compiler::C => c::execute(ctx, submission, in_file, param_file, out_file, err_file).await,
        Compiler::Python => {
            python::execute(ctx, submission, in_file, param_file, out_file, err_file).await
        }
        other => {
            log::error!("execution not supported for compiler {}", other.name());
            monitoring::inc_error("test");
            bail!("execution not supported for compiler {}", other.name())
        }
    }
}

/// Shared run path for every per-case program execution.
///
/// Stdin comes from the case's input file when one exists, parameters from
/// the case's parameter file (whitespace-split, CR/LF trimmed), and stdout/
/// stderr are captured to files in the run dir, capped. The instance name
/// carries the case stem so concurrent cases of one submission never clash.
pub(crate) async fn execute_program(
    submission: &Submission,
    in_file: &str,
    param_file: &str,
    out_file: &str,
    err_file: &str,
    mounts: Vec<Mount>,
    env: Vec<(String, String)>,
    image: &str,
    command: Vec<String>,
) -> Result<()> {
    let run_dir = &submission.run_dir;
    let test_dir = &submission.test_dir;

    let mut inv = Invocation::new(
        format!("{}-{}", submission.id, in_file),
        image,
        run_dir.clone(),
    );
    inv.timeout = Duration::from_secs(submission.config.timeout_s());
    inv.memory_mb = Some(submission.config.mem_mb());
    inv.mounts = mounts;
    inv.env = env;

    let in_path = test_dir.join(in_file);
    if in_path.is_file() {
        inv.stdin = Some(in_path);
    }
    inv.stdout = Capture::File(run_dir.join(out_file));
    inv.stderr = Capture::File(run_dir.join(err_file));

    inv.command = command;
    let param_path = test_dir.join(param_file);
    if param_path.is_file() {
        if let Ok(params) = std::fs::read_to_string(&param_path) {
            let params: Vec<String> = params
                .trim_matches(&['\r', '\n'][..])
                .split_whitespace()
                .map(str::to_string)
                .collect();
            log::debug!("found parameters: {params:?}");
            inv.command.extend(params);
        }
    }

    match inv.run().await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => bail!("exit status {}", out.status.code().unwrap_or(-1)),
        Err(ExecError::Timeout) => bail!("Timeout"),
        Err(e) => Err(e.into()),
    }
}

/// Runs a compiler invocation, turning a non-zero exit into an error that
/// carries the combined tool output.
pub(crate) async fn run_compile(mut inv: Invocation) -> Result<()> {
    inv.timeout = COMPILE_TIMEOUT;
    inv.stdout = Capture::Buffer;
    inv.stderr = Capture::Buffer;

    match inv.run().await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            let mut text = out.stdout_lossy();
            text.push_str(&out.stderr_lossy());
            bail!("Error compiling:\n{text}")
        }
        Err(ExecError::Timeout) => bail!("Error compiling:\nCompilation timed out"),
        Err(e) => Err(e.into()),
    }
}

/// Names of the plain files in `dir` ending in `suffix`, sorted
pub(crate) fn files_with_suffix(dir: &Path, suffix: &str) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_file() && name.ends_with(suffix) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Paths (relative to `dir`) of all files below `dir` ending in `suffix`
pub(crate) fn files_with_suffix_recursive(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(dir).ok()?;
            let rel = rel.to_string_lossy().into_owned();
            rel.ends_with(suffix).then_some(rel)
        })
        .collect();
    names.sort();
    names
}

/// Appends the captured framework logs to an error message
pub(crate) fn append_output(
    run_dir: &Path,
    out_log: &str,
    err_log: &str,
    message: &str,
) -> String {
    let mut message = message.to_string();
    if let Ok(stdout) = read_capped_to_string(run_dir.join(out_log)) {
        if !stdout.is_empty() {
            message.push_str("\n\nOutput:\n");
            message.push_str(&stdout);
        }
    }
    if let Ok(stderr) = read_capped_to_string(run_dir.join(err_log)) {
        if !stderr.is_empty() {
            message.push_str("\n\nError Output:\n");
            message.push_str(&stderr);
        }
    }
    message
}

/// Synthetic result for a framework run that hit its deadline: one failed
/// case covering the whole suite.
pub(crate) fn suite_timeout_result(submission: &Submission, message: String) -> TestResult {
    TestResult {
        id: submission.id.clone(),
        compiled: true,
        tests_executed: 1,
        tests_failed: 1,
        tests: vec![TestCase {
            name: "Test cases".to_string(),
            success: false,
            error: message,
            ..TestCase::default()
        }],
        ..TestResult::default()
    }
}

/// Concatenated text content of a node's subtree
pub(crate) fn inner_text(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter_map(|n| n.text())
        .collect::<Vec<_>>()
        .concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_files_flat_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.c"), "").unwrap();
        std::fs::write(dir.path().join("a.c"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub.c")).unwrap();

        let names = files_with_suffix(dir.path(), ".c").unwrap();
        assert_eq!(names, vec!["a.c", "b.c"]);
    }

    #[test]
    fn collects_files_recursively_as_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("Main.java"), "").unwrap();
        std::fs::write(dir.path().join("pkg/Util.java"), "").unwrap();
        std::fs::write(dir.path().join("pkg/data.txt"), "").unwrap();

        let names = files_with_suffix_recursive(dir.path(), ".java");
        assert_eq!(names, vec!["Main.java", "pkg/Util.java"]);
    }

    #[test]
    fn inner_text_concatenates_nested_text() {
        let doc = roxmltree::Document::parse(
            "<failure>expected <b>1</b> but was <b>2</b></failure>",
        )
        .unwrap();
        assert_eq!(inner_text(doc.root_element()), "expected 1 but was 2");
    }
}
