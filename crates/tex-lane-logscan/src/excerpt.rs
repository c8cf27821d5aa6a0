//! Bounded log excerpts.

/// Returns the last `max_lines` non-empty lines of `log`.
pub fn tail_lines(log: &str, max_lines: usize) -> Vec<&str> {
    let lines: Vec<&str> = log.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].to_vec()
}

/// Returns an excerpt around line index `at` (or the log tail when `at` is
/// `None`), at most `max_lines` long.
pub fn excerpt(log: &str, at: Option<usize>, max_lines: usize) -> String {
    if max_lines == 0 {
        return String::new();
    }
    match at {
        Some(index) => {
            let lines: Vec<&str> = log.lines().collect();
            let start = index.min(lines.len());
            let end = (start + max_lines).min(lines.len());
            lines[start..end].join("\n")
        }
        None => tail_lines(log, max_lines).join("\n"),
    }
}
