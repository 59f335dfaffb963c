use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::DrifterError;

/// Output of a collaborator process: stdout and stderr interleaved in
/// arrival order (the hypervisor tool writes diagnostics to both,
/// inconsistently), plus the exit status.
#[derive(Debug)]
pub struct CmdOutput {
    pub combined: Vec<u8>,
    pub status: std::process::ExitStatus,
}

impl CmdOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run a program to completion, capturing combined output. Exit status is
/// reported, not judged; callers decide what a non-zero exit means.
pub async fn run(
    program: impl AsRef<OsStr>,
    args: &[impl AsRef<OsStr>],
) -> Result<CmdOutput, DrifterError> {
    let mut child = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DrifterError::Io {
            context: format!("spawning {}", display_name(program.as_ref())),
            source: e,
        })?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let buf = Arc::new(Mutex::new(Vec::new()));
    tokio::join!(drain(stdout, buf.clone()), drain(stderr, buf.clone()));

    let status = child.wait().await.map_err(|e| DrifterError::Io {
        context: format!("waiting for {}", display_name(program.as_ref())),
        source: e,
    })?;

    let combined = std::mem::take(&mut *buf.lock().await);
    Ok(CmdOutput { combined, status })
}

/// Like [`run`], but a non-zero exit is an error carrying the full command
/// line and captured output.
pub async fn run_checked(
    program: impl AsRef<OsStr>,
    args: &[impl AsRef<OsStr>],
) -> Result<CmdOutput, DrifterError> {
    let out = run(&program, args).await?;
    if !out.status.success() {
        let command = command_line(program.as_ref(), args);
        tracing::error!(
            command = %command,
            status = out.exit_code(),
            output = %out.text().trim(),
            "command failed"
        );
        return Err(DrifterError::CommandFailed {
            command,
            status: out.exit_code(),
            output: out.text().trim().to_string(),
        });
    }
    Ok(out)
}

/// Replace the current process image with the given program, inheriting
/// the terminal. Only returns on failure.
pub fn exec_replace(program: impl AsRef<OsStr>, args: &[impl AsRef<OsStr>]) -> DrifterError {
    use std::os::unix::process::CommandExt;
    let err = std::process::Command::new(&program).args(args).exec();
    DrifterError::Io {
        context: format!("replacing process with {}", display_name(program.as_ref())),
        source: err,
    }
}

async fn drain(mut src: impl AsyncRead + Unpin, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

fn display_name(program: &OsStr) -> String {
    Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

fn command_line(program: &OsStr, args: &[impl AsRef<OsStr>]) -> String {
    let mut parts = vec![program.to_string_lossy().into_owned()];
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}
