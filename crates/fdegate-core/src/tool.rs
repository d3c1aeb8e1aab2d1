//! Shared invocation helper for external tools.

use crate::error::{FdegateError, FdegateResult};
use fdegate_provider::{CommandOutput, CommandRunner};
use log::debug;
use std::path::Path;

/// Run `program` through `runner`, logging the argument vector (never stdin).
pub(crate) fn invoke<R: CommandRunner>(
    runner: &R,
    program: &Path,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> FdegateResult<CommandOutput> {
    debug!("running {} {}", program.display(), args.join(" "));
    let output = runner
        .run(program, args, stdin)
        .map_err(|err| FdegateError::Provider(format!("{}: {err}", program.display())))?;
    debug!("{} exited with code {}", program.display(), output.status);
    Ok(output)
}
