//! POSIX shell argument escaping for commands sent over SSH.

use std::sync::LazyLock;

use regex::Regex;

static SHELL_SPECIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^A-Za-z0-9_\-.,:/@\n])").expect("shell escape pattern is valid")
});

/// Escape one argument so a remote shell sees it verbatim.
pub fn escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    SHELL_SPECIAL
        .replace_all(arg, r"\${1}")
        .replace('\n', "'\n'")
}

/// Escape every argument and join them with spaces.
pub fn join_escaped<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| escape(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
