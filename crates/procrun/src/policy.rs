//! Failure policy: turns an unsuccessful exit into a [`CommandFailureError`].

use crate::command::Command;
use crate::error::CommandFailureError;
use crate::status::ExitStatus;

const OPEN_BRACKET: char = '⟨';
const CLOSE_BRACKET: char = '⟩';

/// Pass `status` through unless it failed and the command asked to throw.
pub fn apply_failure_policy(
    command: &Command,
    status: ExitStatus,
) -> Result<ExitStatus, CommandFailureError> {
    if status.success() || !command.throw_on_failure() {
        return Ok(status);
    }

    let message = format!("command failed: {}: {}", render_argv(command.argv()), status);
    Err(CommandFailureError::new(message, command.clone(), status))
}

/// Space-join `argv`, bracketing elements whose boundaries would be ambiguous.
///
/// Brackets are deliberately not shell quotes; the output is for humans and
/// implies no quoting dialect.
pub fn render_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if needs_brackets(arg) {
                format!("{OPEN_BRACKET}{arg}{CLOSE_BRACKET}")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn needs_brackets(arg: &str) -> bool {
    arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '`'))
}
