use std::fmt::Write;

/// Render a compact unified-style diff between two versions of one file.
/// Common leading and trailing lines are trimmed to a single hunk with the
/// given context; good enough for mutation previews and session reports.
pub fn unified_diff(path: &str, old: &str, new: &str, context_lines: usize) -> String {
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(new_lines.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_lines.len().min(new_lines.len()) - prefix;
    let suffix = old_lines
        .iter()
        .rev()
        .zip(new_lines.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(max_suffix);

    let ctx_start = prefix.saturating_sub(context_lines);
    let old_end = old_lines.len() - suffix;
    let new_end = new_lines.len() - suffix;
    let ctx_end = (old_end + context_lines).min(old_lines.len());

    let mut out = String::new();
    let _ = writeln!(out, "--- a/{path}");
    let _ = writeln!(out, "+++ b/{path}");
    let _ = writeln!(
        out,
        "@@ -{},{} +{},{} @@",
        ctx_start + 1,
        ctx_end - ctx_start,
        ctx_start + 1,
        (new_end + ctx_end - old_end) - ctx_start,
    );

    for line in &old_lines[ctx_start..prefix] {
        let _ = writeln!(out, " {line}");
    }
    for line in &old_lines[prefix..old_end] {
        let _ = writeln!(out, "-{line}");
    }
    for line in &new_lines[prefix..new_end] {
        let _ = writeln!(out, "+{line}");
    }
    for line in &old_lines[old_end..ctx_end] {
        let _ = writeln!(out, " {line}");
    }

    out
}

/// Cap a diff at `max_lines` output lines, noting how much was dropped.
pub fn truncate_diff(diff: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    if lines.len() <= max_lines {
        return diff.to_string();
    }
    let mut out: String = lines[..max_lines].join("\n");
    let _ = write!(out, "\n... ({} more lines)", lines.len() - max_lines);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_yields_empty_diff() {
        assert_eq!(unified_diff("a.txt", "same\n", "same\n", 3), "");
    }

    #[test]
    fn single_line_change_is_marked() {
        let old = "one\ntwo\nthree\n";
        let new = "one\nTWO\nthree\n";
        let diff = unified_diff("a.txt", old, new, 1);
        assert!(diff.contains("--- a/a.txt"));
        assert!(diff.contains("-two"));
        assert!(diff.contains("+TWO"));
        assert!(diff.contains(" one"));
        assert!(diff.contains(" three"));
    }

    #[test]
    fn appended_lines_show_as_additions() {
        let diff = unified_diff("a.txt", "one\n", "one\ntwo\n", 3);
        assert!(diff.contains("+two"));
        assert!(!diff.contains("-one"));
    }

    #[test]
    fn truncation_notes_dropped_lines() {
        let diff = "a\nb\nc\nd\ne";
        let truncated = truncate_diff(diff, 2);
        assert!(truncated.starts_with("a\nb"));
        assert!(truncated.contains("3 more lines"));
    }
}
