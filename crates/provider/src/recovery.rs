//! Text-to-tool-call recovery.
//!
//! Some models reply with prose that embeds the tool call as JSON instead of
//! using the structured tool-call channel. `recover` extracts the first JSON
//! object that names an allowed tool. The scan is deterministic and single
//! pass: candidates are tried left to right and the first valid one wins.

use serde_json::Value;

use crate::types::ToolCall;

/// Attempt to pull a tool call out of free text. Returns `None` when no
/// balanced JSON object in `text` resolves to an allowed tool.
pub fn recover(text: &str, allowed_tools: &[String]) -> Option<ToolCall> {
    for candidate in JsonObjectScanner::new(text) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if let Some(call) = interpret(&value, allowed_tools) {
            return Some(call);
        }
    }
    None
}

/// Interpret a parsed JSON value as a tool call in one of the shapes models
/// actually emit.
fn interpret(value: &Value, allowed_tools: &[String]) -> Option<ToolCall> {
    let obj = value.as_object()?;

    // Wrapper shapes: {"tool_call": {...}} / {"function": {...}}
    for wrapper in ["tool_call", "function"] {
        if let Some(inner) = obj.get(wrapper) {
            if let Some(call) = interpret(inner, allowed_tools) {
                return Some(call);
            }
        }
    }

    let name = obj
        .get("name")
        .or_else(|| obj.get("tool"))
        .or_else(|| obj.get("tool_name"))?
        .as_str()?;

    if !allowed_tools.iter().any(|t| t == name) {
        return None;
    }

    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("args"))
        .or_else(|| obj.get("parameters"))
        .or_else(|| obj.get("input"))
        .cloned()
        .unwrap_or(Value::Object(serde_json::Map::new()));

    // Providers sometimes double-encode arguments as a JSON string.
    let arguments = match arguments {
        Value::String(s) => serde_json::from_str::<Value>(&s).ok()?,
        other => other,
    };

    if !arguments.is_object() {
        return None;
    }

    Some(ToolCall {
        id: String::new(),
        name: name.to_string(),
        arguments,
    })
}

/// Iterator over balanced `{...}` substrings of a text, left to right.
/// String literals and escapes are honored so braces inside JSON strings do
/// not terminate an object early.
struct JsonObjectScanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> JsonObjectScanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl<'a> Iterator for JsonObjectScanner<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() {
            if bytes[self.pos] != b'{' {
                self.pos += 1;
                continue;
            }
            let start = self.pos;
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            let mut i = start;
            while i < bytes.len() {
                let b = bytes[i];
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                } else {
                    match b {
                        b'"' => in_string = true,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                self.pos = i + 1;
                                return Some(&self.text[start..=i]);
                            }
                        }
                        _ => {}
                    }
                }
                i += 1;
            }
            // Unbalanced from this brace; skip it and keep scanning.
            self.pos = start + 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allowed() -> Vec<String> {
        vec!["write_file".to_string(), "replace_in_file".to_string()]
    }

    #[test]
    fn recovers_bare_json_object() {
        let text = r#"{"name": "write_file", "arguments": {"path": "a.txt", "content": "hi"}}"#;
        let call = recover(text, &allowed()).unwrap();
        assert_eq!(call.name, "write_file");
        assert_eq!(call.arguments["path"], "a.txt");
    }

    #[test]
    fn recovers_from_surrounding_prose() {
        let text = "Sure, I'll update the file now.\n\n```json\n\
                    {\"tool\": \"replace_in_file\", \"args\": {\"path\": \"b.rs\", \"find\": \"x\", \"replace\": \"y\"}}\n\
                    ```\nDone.";
        let call = recover(text, &allowed()).unwrap();
        assert_eq!(call.name, "replace_in_file");
        assert_eq!(call.arguments["find"], "x");
    }

    #[test]
    fn recovers_wrapped_function_shape() {
        let text = r#"{"function": {"name": "write_file", "arguments": "{\"path\": \"c\", \"content\": \"z\"}"}}"#;
        let call = recover(text, &allowed()).unwrap();
        assert_eq!(call.name, "write_file");
        assert_eq!(call.arguments["content"], "z");
    }

    #[test]
    fn rejects_disallowed_tool_names() {
        let text = r#"{"name": "delete_everything", "arguments": {}}"#;
        assert!(recover(text, &allowed()).is_none());
    }

    #[test]
    fn rejects_plain_prose() {
        assert!(recover("I'll update the file first...", &allowed()).is_none());
    }

    #[test]
    fn first_valid_candidate_wins() {
        let text = r#"{"name": "unknown", "arguments": {}} {"name": "write_file", "arguments": {"path": "p"}}"#;
        let call = recover(text, &allowed()).unwrap();
        assert_eq!(call.name, "write_file");
    }

    #[test]
    fn braces_inside_strings_do_not_break_matching() {
        let text = r#"{"name": "write_file", "arguments": {"content": "fn main() { }"}}"#;
        let call = recover(text, &allowed()).unwrap();
        assert_eq!(call.arguments["content"], "fn main() { }");
    }

    #[test]
    fn arguments_must_be_an_object() {
        let text = r#"{"name": "write_file", "arguments": [1, 2]}"#;
        assert!(recover(text, &allowed()).is_none());
    }

    #[test]
    fn interpret_accepts_input_key() {
        let value = json!({"name": "write_file", "input": {"path": "x"}});
        let call = interpret(&value, &allowed()).unwrap();
        assert_eq!(call.arguments["path"], "x");
    }
}
