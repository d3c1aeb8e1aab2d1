//! Contract for executing the external encryption-management tools.

use std::error::Error;
use std::path::Path;

/// Captured result of one external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Lossy UTF-8 view of stdout.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr if present, otherwise stdout, trimmed. Used for diagnostics.
    pub fn diagnostic(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Runs an external program to completion.
///
/// Implementations block until the process exits. An optional `stdin`
/// payload is written and the pipe closed before waiting.
pub trait CommandRunner {
    type Error: Error + Send + Sync + 'static;

    fn run(
        &self,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Self::Error>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    type Error = T::Error;

    fn run(
        &self,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Self::Error> {
        (**self).run(program, args, stdin)
    }
}
