use std::path::Path;
use std::process::Command;

/// One-time look at the repository before the loop starts: directory shape,
/// VCS state, recently touched files, and literal file references in the
/// request. No tasks are created here.
#[derive(Debug, Clone, Default)]
pub struct RepoAnalysis {
    pub context: String,
    pub referenced_files: Vec<String>,
}

pub fn analyze(workspace_root: &Path, request: &str) -> RepoAnalysis {
    let mut sections = Vec::new();

    let tree = directory_overview(workspace_root, 2);
    if !tree.is_empty() {
        sections.push(format!("Directory layout:\n{tree}"));
    }

    if let Some(git) = git_state(workspace_root) {
        sections.push(format!("Git state:\n{git}"));
    }

    let recent = recently_modified(workspace_root, 5);
    if !recent.is_empty() {
        sections.push(format!("Recently modified: {}", recent.join(", ")));
    }

    let referenced_files = literal_file_references(workspace_root, request);
    if !referenced_files.is_empty() {
        sections.push(format!(
            "Files named in the request: {}",
            referenced_files.join(", ")
        ));
    }

    RepoAnalysis {
        context: sections.join("\n\n"),
        referenced_files,
    }
}

const SKIP_DIRS: &[&str] = &["node_modules", ".git", "target", "__pycache__", ".venv", "dist"];

fn directory_overview(root: &Path, max_depth: usize) -> String {
    let mut lines = Vec::new();
    walk(root, 0, max_depth, &mut lines);
    lines.truncate(60);
    lines.join("\n")
}

fn walk(dir: &Path, depth: usize, max_depth: usize, lines: &mut Vec<String>) {
    if depth >= max_depth || lines.len() >= 60 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        let indent = "  ".repeat(depth);
        if entry.path().is_dir() {
            lines.push(format!("{indent}{name}/"));
            walk(&entry.path(), depth + 1, max_depth, lines);
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }
}

fn git_state(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["status", "--porcelain=v1", "--branch"])
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = text.lines().take(20).collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn recently_modified(root: &Path, limit: usize) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut files: Vec<(std::time::SystemTime, String)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, name))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files.into_iter().take(limit).map(|(_, name)| name).collect()
}

/// Extract path-looking tokens from the request and keep the ones that
/// actually exist in the workspace.
pub fn literal_file_references(root: &Path, request: &str) -> Vec<String> {
    let pattern = regex::Regex::new(r"[A-Za-z0-9_./-]+\.[A-Za-z0-9]{1,5}").expect("static regex");
    let mut found = Vec::new();
    for capture in pattern.find_iter(request) {
        let candidate = capture.as_str().trim_matches(|c| c == '.' || c == ',');
        if candidate.is_empty() || found.iter().any(|f| f == candidate) {
            continue;
        }
        if root.join(candidate).is_file() {
            found.push(candidate.to_string());
        }
    }
    found
}
