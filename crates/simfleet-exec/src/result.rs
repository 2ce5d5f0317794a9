//! Outcome of a finished command.

/// Captured outcome of one `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Rendered command line, for logs and errors.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was killed by a signal or timed out.
    pub exit_code: i32,
    pub success: bool,
    pub pid: Option<u32>,
    pub timed_out: bool,
}

impl CommandResult {
    /// Non-empty, trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_skip_blank_output() {
        let result = CommandResult {
            command: "ls".into(),
            stdout: "a\n\n  b  \n".into(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
            pid: Some(1),
            timed_out: false,
        };
        assert_eq!(result.lines().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(result.stdout_trimmed(), "a\n\n  b");
    }
}
