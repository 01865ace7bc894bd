//! Shell quoting for commands shown to the operator.

/// Escape single quotes within a string for use inside a single-quoted shell argument.
fn shell_escape(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Quote a string so it can be pasted into a POSIX shell as one argument.
///
/// Tokens made only of characters common in container arguments
/// (alphanumerics and `-_./:=@,+%`) are returned unchanged.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | ',' | '+' | '%')
    }) {
        s.to_string()
    } else {
        format!("'{}'", shell_escape(s))
    }
}

/// Render `program` and `args` as a single copy-pasteable command line.
pub fn join_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut out = shell_quote(program);
    for arg in args {
        out.push(' ');
        out.push_str(&shell_quote(arg.as_ref()));
    }
    out
}
