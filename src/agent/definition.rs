//! Agent definition files
//!
//! One markdown file per agent: optional `---` front matter carrying
//! `name`, `description`, `model`, and `allowed_tools`, followed by prompt
//! sections keyed by header. Parsing is tolerant; unrecognized sections are
//! kept as additional instruction content.

use std::path::Path;

use crate::error::{NifflerError, Result};
use crate::store::ConversationMode;

/// Immutable agent configuration loaded at startup
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub allowed_tools: Vec<String>,
    /// Model nickname override; falls back to the config default
    pub model: Option<String>,
    pub common_prompt: String,
    pub plan_prompt: String,
    pub code_prompt: String,
    pub extra_instructions: String,
}

impl AgentDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NifflerError::AgentDefinition(format!("{}: {}", path.display(), e))
        })?;
        let fallback = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::parse(&text, &fallback)
    }

    pub fn parse(text: &str, fallback_name: &str) -> Result<Self> {
        let (front_matter, body) = split_front_matter(text);

        let mut definition = AgentDefinition {
            name: fallback_name.to_string(),
            description: String::new(),
            allowed_tools: Vec::new(),
            model: None,
            common_prompt: String::new(),
            plan_prompt: String::new(),
            code_prompt: String::new(),
            extra_instructions: String::new(),
        };

        parse_metadata(front_matter, &mut definition);

        if definition.name.is_empty() {
            return Err(NifflerError::AgentDefinition(
                "agent definition has no name".to_string(),
            ));
        }

        parse_sections(body, &mut definition);
        Ok(definition)
    }

    /// System prompt for the given conversation mode
    pub fn system_prompt(&self, mode: ConversationMode) -> String {
        let mode_prompt = match mode {
            ConversationMode::Plan => &self.plan_prompt,
            ConversationMode::Code => &self.code_prompt,
        };
        let mut prompt = self.common_prompt.trim().to_string();
        for part in [mode_prompt.trim(), self.extra_instructions.trim()] {
            if !part.is_empty() {
                if !prompt.is_empty() {
                    prompt.push_str("\n\n");
                }
                prompt.push_str(part);
            }
        }
        prompt
    }

    /// Starter definition written by `niffler init`
    pub fn starter(name: &str) -> String {
        format!(
            "---\nname: {name}\ndescription: General-purpose assistant\nallowed_tools: read, list, create, edit, bash\n---\n\n\
             # Common System Prompt\nYou are {name}, a capable terminal assistant. Be concise.\n\n\
             # Plan Mode Prompt\nYou are planning. Only create new files; never modify existing ones.\n\n\
             # Code Mode Prompt\nYou are implementing. Prefer small, verifiable edits.\n"
        )
    }
}

/// Returns (front matter lines, remaining body)
fn split_front_matter(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start_matches('\u{feff}');
    if let Some(rest) = trimmed.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let matter = &rest[..end];
            let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
            return (matter, body);
        }
    }
    ("", trimmed)
}

fn parse_metadata(front_matter: &str, definition: &mut AgentDefinition) {
    let mut in_tools_list = false;
    for line in front_matter.lines() {
        let line = line.trim_end();
        if in_tools_list {
            if let Some(item) = line.trim_start().strip_prefix("- ") {
                definition.allowed_tools.push(item.trim().to_string());
                continue;
            }
            in_tools_list = false;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "name" => {
                if !value.is_empty() {
                    definition.name = value.to_string();
                }
            }
            "description" => definition.description = value.to_string(),
            "model" => {
                if !value.is_empty() {
                    definition.model = Some(value.to_string());
                }
            }
            "allowed_tools" => {
                if value.is_empty() {
                    in_tools_list = true;
                } else {
                    definition.allowed_tools = value
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
            }
            _ => {}
        }
    }
}

fn parse_sections(body: &str, definition: &mut AgentDefinition) {
    let mut current: Option<String> = None;
    let mut buffer = String::new();

    let flush = |section: &Option<String>, buffer: &mut String, def: &mut AgentDefinition| {
        let content = buffer.trim().to_string();
        buffer.clear();
        if content.is_empty() {
            return;
        }
        match section.as_deref().map(str::to_lowercase).as_deref() {
            Some("common system prompt") => def.common_prompt = content,
            Some("plan mode prompt") => def.plan_prompt = content,
            Some("code mode prompt") => def.code_prompt = content,
            Some(other) => {
                if !def.extra_instructions.is_empty() {
                    def.extra_instructions.push_str("\n\n");
                }
                def.extra_instructions.push_str(&format!("# {}\n{}", other, content));
            }
            // Untitled preamble becomes the common prompt when none is given
            None => {
                if def.common_prompt.is_empty() {
                    def.common_prompt = content;
                } else {
                    if !def.extra_instructions.is_empty() {
                        def.extra_instructions.push_str("\n\n");
                    }
                    def.extra_instructions.push_str(&content);
                }
            }
        }
    };

    for line in body.lines() {
        if let Some(header) = line.strip_prefix("# ") {
            flush(&current, &mut buffer, definition);
            current = Some(header.trim().to_string());
        } else {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }
    flush(&current, &mut buffer, definition);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FULL: &str = "---\n\
name: coder\n\
description: Fixes bugs\n\
model: gpt4o\n\
allowed_tools: read, edit, bash\n\
---\n\
\n\
# Common System Prompt\n\
You are coder.\n\
\n\
# Plan Mode Prompt\n\
Plan carefully.\n\
\n\
# Code Mode Prompt\n\
Implement carefully.\n\
\n\
# House Rules\n\
Never push to main.\n";

    #[test]
    fn test_parse_full_definition() {
        let def = AgentDefinition::parse(FULL, "fallback").unwrap();
        assert_eq!(def.name, "coder");
        assert_eq!(def.description, "Fixes bugs");
        assert_eq!(def.model.as_deref(), Some("gpt4o"));
        assert_eq!(def.allowed_tools, vec!["read", "edit", "bash"]);
        assert_eq!(def.common_prompt, "You are coder.");
        assert_eq!(def.plan_prompt, "Plan carefully.");
        assert_eq!(def.code_prompt, "Implement carefully.");
        assert!(def.extra_instructions.contains("Never push to main."));
    }

    #[test]
    fn test_system_prompt_by_mode() {
        let def = AgentDefinition::parse(FULL, "fallback").unwrap();
        let plan = def.system_prompt(ConversationMode::Plan);
        assert!(plan.contains("You are coder."));
        assert!(plan.contains("Plan carefully."));
        assert!(!plan.contains("Implement carefully."));

        let code = def.system_prompt(ConversationMode::Code);
        assert!(code.contains("Implement carefully."));
        // Unknown sections ride along as extra instructions
        assert!(code.contains("Never push to main."));
    }

    #[test]
    fn test_dash_list_tools() {
        let text = "---\nname: researcher\nallowed_tools:\n  - read\n  - fetch\n---\nBe thorough.\n";
        let def = AgentDefinition::parse(text, "x").unwrap();
        assert_eq!(def.allowed_tools, vec!["read", "fetch"]);
        // Untitled body becomes the common prompt
        assert_eq!(def.common_prompt, "Be thorough.");
    }

    #[test]
    fn test_no_front_matter_uses_fallback_name() {
        let def = AgentDefinition::parse("Just a prompt.\n", "notes").unwrap();
        assert_eq!(def.name, "notes");
        assert_eq!(def.common_prompt, "Just a prompt.");
        assert!(def.allowed_tools.is_empty());
    }

    #[test]
    fn test_starter_parses() {
        let text = AgentDefinition::starter("helper");
        let def = AgentDefinition::parse(&text, "x").unwrap();
        assert_eq!(def.name, "helper");
        assert!(def.allowed_tools.contains(&"bash".to_string()));
        assert!(!def.system_prompt(ConversationMode::Plan).is_empty());
    }
}
