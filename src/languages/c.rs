use anyhow::Result;

use crate::config::RunContext;
use crate::sandbox::Invocation;
use crate::submission::Submission;

use super::{execute_program, files_with_suffix, run_compile};

/// Compiles every `.c` file in the run dir with warnings as errors and the
/// address/undefined-behavior sanitizers enabled.
pub async fn compile(ctx: &RunContext, submission: &Submission) -> Result<()> {
    let c_files = files_with_suffix(&submission.run_dir, ".c")?;

    let mut inv = Invocation::new(
        submission.id.clone(),
        &ctx.images.c,
        submission.run_dir.clone(),
    );
    inv.command = [
        "clang",
        "-Wall",
        "-Werror",
        "-fsanitize=address",
        "-fsanitize=undefined",
        "-g",
    ]
    .map(String::from)
    .to_vec();
    inv.command.extend(c_files);

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
    let env = vec![("ASAN_OPTIONS".to_string(), "detect_leaks=1".to_string())];
    // stdbuf disables buffering so output reaches the file even on a crash
    let command = ["stdbuf", "-o0", "./a.out"].map(String::from).to_vec();

    execute_program(
        submission,
        in_file,
        param_file,
        out_file,
        err_file,
        Vec::new(),
        env,
        &ctx.images.c,
        command,
    )
    .await
}
