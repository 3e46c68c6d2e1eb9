use serde::{Deserialize, Serialize};

/// What a killed subprocess was most likely doing when its timeout expired.
/// Derived from partial output, so replanning can fix the cause (e.g. a
/// watch-mode test script) instead of blindly retrying.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutDiagnosis {
    pub is_watch_mode: bool,
    pub is_hanging_server: bool,
    pub is_interactive_prompt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

const WATCH_MARKERS: &[&str] = &[
    "watching for file changes",
    "press h for help",
    "press q to quit",
];

const SERVER_MARKERS: &[&str] = &["server listening on port", "application started"];

const INTERACTIVE_MARKERS: &[&str] = &["waiting for input", "press any key"];

pub fn diagnose_timeout(command: &str, output: &str) -> TimeoutDiagnosis {
    let lower = output.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    let is_watch_mode = contains_any(WATCH_MARKERS);
    let is_hanging_server = contains_any(SERVER_MARKERS);
    let is_interactive_prompt = contains_any(INTERACTIVE_MARKERS);
    let framework = detect_framework(command, output);

    let suggested_fix = if is_watch_mode {
        Some(match framework.as_deref() {
            Some("vitest") => {
                "test script runs vitest in watch mode; change it from `vitest` to `vitest run`"
                    .to_string()
            }
            Some("jest") => {
                "test script runs jest in watch mode; add `--watchAll=false` (or `--ci`)"
                    .to_string()
            }
            _ => "test command never exits (watch mode); switch it to a run-once variant"
                .to_string(),
        })
    } else if is_hanging_server {
        Some("command starts a long-running server; run it in the background or skip it".into())
    } else if is_interactive_prompt {
        Some("command waits for interactive input; pass a non-interactive flag".into())
    } else {
        None
    };

    TimeoutDiagnosis {
        is_watch_mode,
        is_hanging_server,
        is_interactive_prompt,
        framework,
        suggested_fix,
    }
}

/// Framework detection prefers command tokens over output contents: a
/// command that says `vitest` IS vitest no matter what the output mentions.
/// Output is consulted only when the command is ambiguous.
pub fn detect_framework(command: &str, output: &str) -> Option<String> {
    let command_lower = command.to_lowercase();
    for token in ["vitest", "jest", "mocha", "pytest", "cargo test", "go test"] {
        if command_lower.contains(token) {
            return Some(normalize_framework(token));
        }
    }

    let output_lower = output.to_lowercase();
    for token in ["vitest", "jest", "mocha", "pytest"] {
        if output_lower.contains(token) {
            return Some(token.to_string());
        }
    }
    None
}

fn normalize_framework(token: &str) -> String {
    match token {
        "cargo test" => "cargo".to_string(),
        "go test" => "go".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_mode_detected_with_vitest_fix() {
        let diagnosis = diagnose_timeout(
            "npm test",
            "RUN vitest v1.2.0\nWatching for file changes...\npress h for help",
        );
        assert!(diagnosis.is_watch_mode);
        assert!(!diagnosis.is_hanging_server);
        let fix = diagnosis.suggested_fix.unwrap();
        assert!(fix.contains("vitest run"));
    }

    #[test]
    fn hanging_server_detected() {
        let diagnosis = diagnose_timeout("npm start", "Server listening on port 3000");
        assert!(diagnosis.is_hanging_server);
        assert!(!diagnosis.is_watch_mode);
        assert!(diagnosis.suggested_fix.is_some());
    }

    #[test]
    fn interactive_prompt_detected() {
        let diagnosis = diagnose_timeout("some-tool", "Press any key to continue");
        assert!(diagnosis.is_interactive_prompt);
    }

    #[test]
    fn clean_timeout_has_no_fix() {
        let diagnosis = diagnose_timeout("sleep 1000", "");
        assert_eq!(diagnosis, TimeoutDiagnosis::default());
    }

    #[test]
    fn command_tokens_beat_output_contents() {
        // The output mentions jest, but the command says vitest.
        let framework = detect_framework("npx vitest", "jest-like output with jest mentions");
        assert_eq!(framework.as_deref(), Some("vitest"));
    }

    #[test]
    fn output_consulted_only_when_command_is_ambiguous() {
        let framework = detect_framework("npm test", "RUN vitest v1.2.0");
        assert_eq!(framework.as_deref(), Some("vitest"));
        assert_eq!(detect_framework("npm test", "no hints here"), None);
    }
}
