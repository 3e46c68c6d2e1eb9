use drover_provider::ToolDefinition;

use crate::task::ActionType;
use crate::tools::ToolRegistry;

/// Chooses which tool schemas an agent's LLM call presents. Scoring narrows
/// the set by description keywords, but the result is guaranteed non-empty
/// whenever the action class has any registered candidates; the gateway
/// additionally falls back to the curated list if this ever returns empty.
pub struct SchemaSelector;

impl SchemaSelector {
    /// Candidate tool names per action class.
    pub fn candidates(action: ActionType) -> &'static [&'static str] {
        match action {
            ActionType::Read
            | ActionType::Research
            | ActionType::Analyze
            | ActionType::Review
            | ActionType::Investigate => &[
                "read_file",
                "list_dir",
                "tree_view",
                "file_exists",
                "search_code",
                "git_status",
                "git_diff",
            ],
            ActionType::Edit => &[
                "apply_patch",
                "replace_in_file",
                "write_file",
                "copy_file",
                "move_file",
            ],
            ActionType::Add | ActionType::Create => &[
                "write_file",
                "apply_patch",
                "replace_in_file",
                "copy_file",
                "move_file",
            ],
            ActionType::Refactor => &[
                "read_file",
                "replace_in_file",
                "apply_patch",
                "write_file",
                "move_file",
                "delete_file",
                "search_code",
            ],
            ActionType::Delete => &["delete_file", "move_file", "file_exists", "list_dir"],
            ActionType::Test => &["run_tests", "run_cmd", "file_exists", "list_dir"],
            ActionType::Debug | ActionType::Fix => &[
                "read_file",
                "replace_in_file",
                "write_file",
                "apply_patch",
                "run_cmd",
                "search_code",
            ],
            ActionType::Document => &["read_file", "write_file", "replace_in_file", "list_dir"],
            ActionType::Tool => &["read_file", "write_file", "list_dir"],
            ActionType::Execute => &["run_cmd", "git_status", "git_diff", "git_commit"],
        }
    }

    /// Keyword affinities used to rank candidates against the description.
    fn keywords(tool: &str) -> &'static [&'static str] {
        match tool {
            "replace_in_file" => &["replace", "change", "rename", "substitute", "swap"],
            "apply_patch" => &["patch", "diff", "hunk"],
            "write_file" => &["write", "rewrite", "create", "new file", "generate", "full"],
            "read_file" => &["read", "look", "inspect", "view", "examine"],
            "delete_file" => &["delete", "remove", "drop"],
            "move_file" => &["move", "rename", "relocate"],
            "copy_file" => &["copy", "duplicate"],
            "search_code" => &["search", "find", "grep", "locate", "where"],
            "run_tests" => &["test", "suite", "spec"],
            "run_cmd" => &["run", "command", "execute", "build", "install"],
            "list_dir" => &["list", "directory", "folder"],
            "tree_view" => &["tree", "structure", "layout"],
            "git_status" => &["status", "staged"],
            "git_diff" => &["diff", "changes"],
            "git_commit" => &["commit"],
            _ => &[],
        }
    }

    /// Schemas to offer for one task. Scored subset when the description
    /// clearly favors some candidates, full candidate set otherwise.
    pub fn select(
        &self,
        registry: &ToolRegistry,
        action: ActionType,
        description: &str,
    ) -> Vec<ToolDefinition> {
        let candidates: Vec<&str> = Self::candidates(action)
            .iter()
            .copied()
            .filter(|name| registry.get(name).is_some())
            .collect();

        if candidates.is_empty() {
            return Vec::new();
        }

        let lower = description.to_lowercase();
        let mut scored: Vec<(&str, usize)> = candidates
            .iter()
            .map(|&name| {
                let score = Self::keywords(name)
                    .iter()
                    .filter(|kw| lower.contains(*kw))
                    .count();
                (name, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        let hits: Vec<&str> = scored
            .iter()
            .filter(|(_, score)| *score > 0)
            .map(|(name, _)| *name)
            .collect();

        // Narrow only when at least two candidates scored; a single hit
        // would leave the model without a fallback tool.
        let chosen: Vec<&str> = if hits.len() >= 2 { hits } else { candidates };

        registry.definitions_for(&chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::default_registry;

    #[test]
    fn every_action_class_has_candidates() {
        let registry = default_registry();
        let selector = SchemaSelector;
        for action in ActionType::ALL {
            let defs = selector.select(&registry, action, "do the thing");
            assert!(!defs.is_empty(), "no tools selected for {action}");
        }
    }

    #[test]
    fn research_class_gets_only_read_tools() {
        let registry = default_registry();
        let defs = SchemaSelector.select(&registry, ActionType::Read, "inspect the module");
        for def in &defs {
            assert!(
                !matches!(def.name.as_str(), "write_file" | "delete_file" | "replace_in_file"),
                "{} offered to a research task",
                def.name
            );
        }
    }

    #[test]
    fn keyword_hits_narrow_the_set() {
        let registry = default_registry();
        let defs = SchemaSelector.select(
            &registry,
            ActionType::Edit,
            "replace the test script and patch the config",
        );
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"replace_in_file"));
        assert!(names.contains(&"apply_patch"));
        assert!(!names.contains(&"copy_file"));
    }

    #[test]
    fn no_keyword_hits_returns_full_class() {
        let registry = default_registry();
        let defs = SchemaSelector.select(&registry, ActionType::Edit, "adjust things");
        assert_eq!(defs.len(), SchemaSelector::candidates(ActionType::Edit).len());
    }
}
