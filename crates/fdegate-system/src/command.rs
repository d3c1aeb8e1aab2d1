//! Process execution for the host tools (`fdesetup`, `security`, `reboot`).

use fdegate_core::error::{FdegateError, FdegateResult};
use fdegate_provider::{CommandOutput, CommandRunner};
use log::{debug, warn};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Runs programs with piped stdio, optionally bounded by a timeout.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn wait(&self, program: &Path, child: &mut Child) -> FdegateResult<i32> {
        let Some(limit) = self.timeout else {
            return Ok(exit_code(child.wait()?));
        };

        let start = Instant::now();
        while start.elapsed() <= limit {
            if let Some(status) = child.try_wait()? {
                return Ok(exit_code(status));
            }
            thread::sleep(Duration::from_millis(25));
        }

        let _ = child.kill();
        let _ = child.wait();
        warn!("{} timed out after {limit:?}", program.display());
        Err(FdegateError::Provider(format!(
            "{} timed out after {limit:?}",
            program.display()
        )))
    }
}

impl CommandRunner for SystemCommandRunner {
    type Error = FdegateError;

    fn run(
        &self,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> FdegateResult<CommandOutput> {
        debug!("running {} {}", program.display(), args.join(" "));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn()?;

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                if let Err(err) = pipe.write_all(payload) {
                    drop(pipe);
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!("{} stopped reading its input: {err}", program.display());
                    return Err(err.into());
                }
                pipe.flush().ok();
            }
        }

        let stdout = spawn_output_reader(child.stdout.take());
        let stderr = spawn_output_reader(child.stderr.take());
        let status = self.wait(program, &mut child)?;

        let stdout = stdout
            .join()
            .map_err(|_| FdegateError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr
            .join()
            .map_err(|_| FdegateError::Provider("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<FdegateResult<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> FdegateResult<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let runner = SystemCommandRunner::default();
        let out = runner
            .run(&sh(), &["-c", "echo out; echo err >&2; exit 3"], None)
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.diagnostic(), "err");
    }

    #[test]
    fn stdin_payload_reaches_the_child() {
        let runner = SystemCommandRunner::default();
        let out = runner
            .run(&sh(), &["-c", "cat"], Some(b"<plist/>"))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"<plist/>");
    }

    #[test]
    fn closed_stdin_fails_fast_and_reaps_the_child() {
        let runner = SystemCommandRunner::default();
        let payload = vec![b'x'; 1 << 20];
        let start = Instant::now();
        let err = runner
            .run(&sh(), &["-c", "exec 0<&-; sleep 5"], Some(&payload))
            .unwrap_err();
        assert!(matches!(err, FdegateError::Io(ref io) if io.kind() == std::io::ErrorKind::BrokenPipe));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_hung_tools() {
        let runner = SystemCommandRunner::new(Some(Duration::from_millis(100)));
        let err = runner.run(&sh(), &["-c", "sleep 5"], None).unwrap_err();
        assert!(matches!(err, FdegateError::Provider(msg) if msg.contains("timed out")));
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let runner = SystemCommandRunner::default();
        let err = runner
            .run(Path::new("/nonexistent/fdesetup"), &["status"], None)
            .unwrap_err();
        assert!(matches!(err, FdegateError::Io(_)));
    }
}
