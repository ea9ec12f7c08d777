use std::path::Path;

use anyhow::{Result, bail};

use crate::config::RunContext;
use crate::routes::scan_tests;
use crate::submission::RteResult;

/// Replays the stored `_solution/` of each test against a running `/test`
/// endpoint and prints a pass/fail summary. With a test name, only that
/// solution is replayed.
pub async fn run(ctx: &RunContext, host: &str, port: u16, only_test: &str) -> Result<()> {
    let host = if host.is_empty() || host == "0.0.0.0" {
        "127.0.0.1"
    } else {
        host
    };
    let target = format!("http://{host}:{port}/test");
    let client = reqwest::Client::new();

    let tests = if only_test.is_empty() {
        scan_tests(&ctx.testdata_dir)?
    } else {
        vec![only_test.to_string()]
    };

    let mut checked = 0;
    for test in &tests {
        let solution_dir = ctx.testdata_dir.join(test).join("_solution");
        if !solution_dir.is_dir() {
            if !only_test.is_empty() {
                bail!(
                    "Could not find solution folder in {}",
                    solution_dir.display()
                );
            }
            continue;
        }
        println!("Testing solution of {test}");
        send_solution(&client, &target, &ctx.api_key, test, &solution_dir).await?;
        checked += 1;
    }
    println!("Checked {checked} solutions");
    Ok(())
}

async fn send_solution(
    client: &reqwest::Client,
    target: &str,
    api_key: &str,
    test: &str,
    solution_dir: &Path,
) -> Result<()> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(solution_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut form = reqwest::multipart::Form::new()
        .text("test", test.to_string())
        .text("numfiles", files.len().to_string());
    for (i, path) in files.iter().enumerate() {
        let content = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        form = form.part(
            format!("file{i}"),
            reqwest::multipart::Part::bytes(content).file_name(name),
        );
    }

    let mut request = client.post(target).multipart(form);
    if !api_key.is_empty() {
        request = request.header("ApiKey", api_key);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        bail!("Request failed: {}", response.status());
    }
    let result: RteResult = response.json().await?;

    if let Some(file_warnings) = &result.file_warnings {
        for fw in file_warnings {
            if fw.warnings.is_empty() {
                continue;
            }
            println!("\n\nWarnings in {}:", fw.file);
            for warning in &fw.warnings {
                println!(
                    "Warning in line {}: {} - {}\n{}",
                    warning.begin_line, warning.rule_set, warning.rule, warning.message
                );
            }
        }
    }

    let test_result = &result.test_result;
    if !test_result.compiled {
        println!("Compilation problem:\n{}", test_result.compile_error);
        return Ok(());
    }
    if !test_result.internal_error.is_empty() {
        println!("Internal error:\n{}", test_result.internal_error);
    }
    println!(
        "passed {} / {} tests",
        test_result
            .tests_executed
            .saturating_sub(test_result.tests_failed),
        test_result.tests_executed
    );
    for case in test_result.tests.iter().filter(|case| !case.success) {
        println!("TEST {}", case.name);
        println!("{}", case.error);
        if !case.output.is_empty() {
            println!("\n----Output:\n");
            println!("{}", case.output);
        }
        if !case.expected.is_empty() {
            println!("\n----Expected:\n");
            println!("{}", case.expected);
        }
        println!("\n\n");
    }
    Ok(())
}
