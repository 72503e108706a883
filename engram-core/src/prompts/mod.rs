//! Prompt composition for every LLM-driven step.
//!
//! A prompt configuration is either a plain string used verbatim or an
//! ordered block map (objective / workflow / rules / output / examples /
//! input). Blocks without an override fall back to the built-in default for
//! that name; the composed prompt is the non-empty blocks joined by blank
//! lines in ascending ordinal order.
//!
//! Templates carry `{name}` slots filled by [`render_template`]. Rendering
//! is single-pass over the template text only, so braces inside substituted
//! values are inert and can never break expansion.

pub mod category_summary;
pub mod memory_type;
pub mod preprocess;
pub mod retrieve;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Canonical block names and their default ordinals.
pub const DEFAULT_BLOCK_ORDINALS: [(&str, i32); 6] = [
    ("objective", 0),
    ("workflow", 1),
    ("rules", 2),
    ("output", 3),
    ("examples", 4),
    ("input", 5),
];

/// One overridable block of a composed prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptBlock {
    /// Optional display label; unused by composition
    #[serde(default)]
    pub label: Option<String>,
    /// Position in the composed prompt; negative ordinals drop the block
    #[serde(default)]
    pub ordinal: i32,
    /// Override text; `None` falls back to the built-in default
    #[serde(default)]
    pub prompt: Option<String>,
}

/// A user-overridable prompt: verbatim text or an ordered block map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptConfig {
    /// Used verbatim as the template
    Text(String),
    /// Composed from blocks plus built-in defaults
    Blocks(BTreeMap<String, PromptBlock>),
}

impl PromptConfig {
    /// Resolve to a template string using `defaults` for unset blocks.
    ///
    /// `defaults` maps block name to default text; block names present in
    /// neither the config nor the defaults contribute nothing.
    pub fn resolve(&self, defaults: &[(&str, &str)]) -> String {
        match self {
            PromptConfig::Text(text) => text.clone(),
            PromptConfig::Blocks(blocks) => compose_blocks(blocks, defaults),
        }
    }
}

/// Compose a block map into one prompt.
///
/// Missing canonical blocks are completed from `defaults` at their default
/// ordinals; blocks with a negative ordinal or no text are dropped; the
/// rest are sorted by `(ordinal, name)` and joined with blank lines.
pub fn compose_blocks(blocks: &BTreeMap<String, PromptBlock>, defaults: &[(&str, &str)]) -> String {
    let default_text = |name: &str| -> Option<&str> {
        defaults
            .iter()
            .find(|(block, _)| *block == name)
            .map(|(_, text)| *text)
    };

    let mut resolved: Vec<(i32, String, String)> = Vec::new();
    for (name, block) in blocks {
        if block.ordinal < 0 {
            continue;
        }
        let text = block
            .prompt
            .as_deref()
            .or_else(|| default_text(name))
            .unwrap_or("");
        if !text.trim().is_empty() {
            resolved.push((block.ordinal, name.clone(), text.trim().to_string()));
        }
    }
    // Canonical blocks the user did not mention keep their default slot.
    for (name, ordinal) in DEFAULT_BLOCK_ORDINALS {
        if blocks.contains_key(name) {
            continue;
        }
        if let Some(text) = default_text(name) {
            if !text.trim().is_empty() {
                resolved.push((ordinal, name.to_string(), text.trim().to_string()));
            }
        }
    }

    resolved.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    resolved
        .into_iter()
        .map(|(_, _, text)| text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fill `{name}` slots in a template from a variable list.
///
/// Single pass over the template: `{{` and `}}` escape literal braces,
/// unknown slots are left untouched, and substituted values are never
/// re-scanned.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                match vars.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) if closed => out.push_str(value),
                    _ => {
                        out.push('{');
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}
