use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;

use crate::capped::{CappedWriter, MAX_CAPTURE_SIZE};

/// Destination of a captured stream. File and buffer captures are both
/// bounded by [`MAX_CAPTURE_SIZE`].
#[derive(Debug, Clone)]
pub enum Capture {
    Null,
    File(PathBuf),
    Buffer,
}

/// A read-only bind mount added to the sandbox
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// One command invocation inside a named, disposable sandbox container.
///
/// The run directory is bind-mounted read-write at `/code`, which is also
/// the working directory of the command. The instance name is unique per
/// submission and stage, so a deadline overrun can be terminated by name.
#[derive(Debug)]
pub struct Invocation {
    pub name: String,
    pub image: String,
    pub run_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub memory_mb: Option<u64>,
    pub timeout: Duration,
    pub stdin: Option<PathBuf>,
    pub stdout: Capture,
    pub stderr: Capture,
    pub command: Vec<String>,
}

/// Exit information of a finished invocation. Buffer captures are returned
/// inline; file captures end up in the run directory.
#[derive(Debug)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// The deadline fired and the instance was terminated by name.
    #[error("Timeout")]
    Timeout,
    #[error("could not open sandbox input file: {0}")]
    Stdin(std::io::Error),
    #[error("could not create sandbox output file: {0}")]
    OutputFile(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Invocation {
    pub fn new(name: impl Into<String>, image: impl Into<String>, run_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            run_dir,
            mounts: Vec::new(),
            env: Vec::new(),
            memory_mb: None,
            timeout: Duration::from_secs(10),
            stdin: None,
            stdout: Capture::Buffer,
            stderr: Capture::Buffer,
            command: Vec::new(),
        }
    }

    /// Assembles the full `docker run` argument list
    fn docker_args(&self) -> Result<Vec<String>, ExecError> {
        let abs_run_dir = std::fs::canonicalize(&self.run_dir)?;

        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/code", abs_run_dir.display()),
            "--workdir".to_string(),
            "/code".to_string(),
        ];
        if self.stdin.is_some() {
            args.push("-i".to_string());
        }
        if let Some(mem) = self.memory_mb {
            args.push("-m".to_string());
            args.push(format!("{mem}M"));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &self.mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}{suffix}",
                mount.host.display(),
                mount.container
            ));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        Ok(args)
    }

    /// Runs the command to completion under the deadline.
    ///
    /// A non-zero exit is not an error: the status is reported and the
    /// caller interprets it (test frameworks exit 1 on failed tests). On
    /// deadline expiry the container is stopped by name and
    /// [`ExecError::Timeout`] is returned; captured files hold whatever was
    /// produced up to that point. The named slot is free again when this
    /// returns, on every path.
    pub async fn run(&self) -> Result<ExecOutput, ExecError> {
        let args = self.docker_args()?;
        log::debug!("sandbox {}: docker {}", self.name, args.join(" "));

        let mut cmd = Command::new("docker");
        cmd.args(&args)
            .current_dir(&self.run_dir)
            .kill_on_drop(true);

        match &self.stdin {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(ExecError::Stdin)?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stdout_pump = spawn_pump(child.stdout.take(), self.stdout.clone())?;
        let stderr_pump = spawn_pump(child.stderr.take(), self.stderr.clone())?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(waited) => waited?,
            Err(_) => {
                stop_instance(&self.name).await;
                let _ = child.kill().await;
                // drain the pipes so partial output reaches the sinks
                let _ = stdout_pump.await;
                let _ = stderr_pump.await;
                return Err(ExecError::Timeout);
            }
        };

        let stdout = stdout_pump.await.unwrap_or_default();
        let stderr = stderr_pump.await.unwrap_or_default();
        stop_instance(&self.name).await;

        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }
}

/// Copies one child stream into its capture destination, capped.
/// Returns the captured bytes for buffer destinations.
fn spawn_pump<R>(
    reader: Option<R>,
    capture: Capture,
) -> Result<tokio::task::JoinHandle<Vec<u8>>, ExecError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return Ok(tokio::spawn(async { Vec::new() }));
    };

    match capture {
        Capture::Null => Ok(tokio::spawn(async move {
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
            Vec::new()
        })),
        Capture::Buffer => Ok(tokio::spawn(async move {
            let mut sink = CappedWriter::new(Vec::new(), MAX_CAPTURE_SIZE);
            let _ = tokio::io::copy(&mut reader, &mut sink).await;
            sink.into_inner()
        })),
        Capture::File(path) => {
            let file = std::fs::File::create(&path).map_err(ExecError::OutputFile)?;
            Ok(tokio::spawn(async move {
                let mut sink =
                    CappedWriter::new(tokio::fs::File::from_std(file), MAX_CAPTURE_SIZE);
                let _ = tokio::io::copy(&mut reader, &mut sink).await;
                let _ = sink.flush().await;
                Vec::new()
            }))
        }
    }
}

/// Best-effort termination of a named instance. The kill is immediate so a
/// deadline overrun costs no extra grace period; already-gone containers
/// are the common case because `--rm` discards them on exit.
pub async fn stop_instance(name: &str) {
    let result = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => log::debug!("stopped sandbox instance {name}"),
        Ok(_) => {}
        Err(e) => log::debug!("could not stop sandbox instance {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(dir: &std::path::Path) -> Invocation {
        let mut inv = Invocation::new("run-42", "eclipse-temurin:21", dir.to_path_buf());
        inv.command = vec!["javac".to_string(), "Main.java".to_string()];
        inv
    }

    #[test]
    fn docker_args_mounts_run_dir_at_code() {
        let dir = tempfile::tempdir().unwrap();
        let args = invocation(dir.path()).docker_args().unwrap();
        let abs = std::fs::canonicalize(dir.path()).unwrap();

        assert_eq!(args[0], "run");
        assert_eq!(&args[1..4], &["--name", "run-42", "--rm"]);
        assert!(args.contains(&format!("{}:/code", abs.display())));
        assert!(args.contains(&"--workdir".to_string()));
        // image comes before the command
        let image_pos = args.iter().position(|a| a == "eclipse-temurin:21").unwrap();
        let cmd_pos = args.iter().position(|a| a == "javac").unwrap();
        assert!(image_pos < cmd_pos);
    }

    #[test]
    fn docker_args_carry_memory_cap_and_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = invocation(dir.path());
        inv.memory_mb = Some(100);
        inv.stdin = Some(dir.path().join("t1.in.txt"));
        inv.mounts.push(Mount {
            host: PathBuf::from("/opt/jars/junit.jar"),
            container: "/jars/junit.jar".to_string(),
            read_only: true,
        });
        inv.env
            .push(("ASAN_OPTIONS".to_string(), "detect_leaks=1".to_string()));

        let args = inv.docker_args().unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-i"));
        assert!(joined.contains("-m 100M"));
        assert!(joined.contains("-v /opt/jars/junit.jar:/jars/junit.jar:ro"));
        assert!(joined.contains("-e ASAN_OPTIONS=detect_leaks=1"));
    }

    #[test]
    fn missing_run_dir_is_an_error() {
        let inv = invocation(std::path::Path::new("/nonexistent/run/dir"));
        assert!(inv.docker_args().is_err());
    }
}
