//! Default category-summary prompts, with and without item references.
//!
//! Slots: `{category}`, `{original_content}`, `{new_memory_items_text}`,
//! `{target_length}`. The referenced variant requires a `[ref:ID]` citation
//! on every statement drawn from a new item; the ids offered to the model
//! are the items' six-char short ids.

const OBJECTIVE: &str = "\
# Task Objective
You maintain the running summary of one memory category. Merge the newly extracted memory items into the existing summary using only two operations: update an existing statement, or add a new one. Preserve everything the new items do not contradict.";

const OBJECTIVE_WITH_REFS: &str = "\
# Task Objective
You maintain the running summary of one memory category. Merge the newly extracted memory items into the existing summary using only two operations: update an existing statement, or add a new one. Preserve everything the new items do not contradict.

Every statement drawn from a new item MUST carry an inline citation in the form [ref:ID], using the id shown with that item.";

const WORKFLOW: &str = "\
# Workflow
1. Parse the existing summary and the new memory items.
2. Update statements the new items supersede; add statements for new information.
3. Reorganize under markdown headings by subtopic; omit empty sections.
4. Condense toward the target length, merging or dropping the least important details first.";

const RULES_WITH_REFS: &str = "\
# Reference Rules
1. Every statement from a new item carries at least one [ref:ID] citation, placed immediately after the statement.
2. Use the exact ids provided; multiple supporting items may be cited as [ref:id1,id2].
3. Existing statements without new support keep their existing citations and gain none.";

const OUTPUT: &str = "\
# Output Format
Markdown only: # for the category title, ## for subtopics, - for statements. No explanations, no operation traces, no code fences. Stay within {target_length} tokens.";

const OUTPUT_WITH_REFS: &str = "\
# Output Format
Markdown only: # for the category title, ## for subtopics, - for statements with [ref:ID] citations. No explanations, no operation traces, no code fences. Stay within {target_length} tokens.";

const EXAMPLES_WITH_REFS: &str = "\
# Example
New memory items with ids:
- [a1b2c3] The user is 30 years old
- [d4e5f6] The user lives in Lisbon

Output:
# personal_info
## Basics
- The user is 30 years old [ref:a1b2c3]
- The user lives in Lisbon [ref:d4e5f6]";

const INPUT: &str = "\
# Input
Category:
{category}

Existing summary:
<content>
{original_content}
</content>

New memory items:
<items>
{new_memory_items_text}
</items>";

/// Composed default prompt without citations.
pub fn default_prompt() -> String {
    [OBJECTIVE, WORKFLOW, OUTPUT, INPUT].join("\n\n")
}

/// Composed default prompt with `[ref:ID]` citations.
pub fn default_prompt_with_refs() -> String {
    [
        OBJECTIVE_WITH_REFS,
        WORKFLOW,
        RULES_WITH_REFS,
        OUTPUT_WITH_REFS,
        EXAMPLES_WITH_REFS,
        INPUT,
    ]
    .join("\n\n")
}

/// Default block set without citations.
pub fn default_blocks() -> Vec<(&'static str, String)> {
    vec![
        ("objective", OBJECTIVE.to_string()),
        ("workflow", WORKFLOW.to_string()),
        ("output", OUTPUT.to_string()),
        ("input", INPUT.to_string()),
    ]
}

/// Default block set with citations.
pub fn default_blocks_with_refs() -> Vec<(&'static str, String)> {
    vec![
        ("objective", OBJECTIVE_WITH_REFS.to_string()),
        ("workflow", WORKFLOW.to_string()),
        ("rules", RULES_WITH_REFS.to_string()),
        ("output", OUTPUT_WITH_REFS.to_string()),
        ("examples", EXAMPLES_WITH_REFS.to_string()),
        ("input", INPUT.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_variants_carry_all_slots() {
        for prompt in [default_prompt(), default_prompt_with_refs()] {
            assert!(prompt.contains("{category}"));
            assert!(prompt.contains("{original_content}"));
            assert!(prompt.contains("{new_memory_items_text}"));
            assert!(prompt.contains("{target_length}"));
        }
    }

    #[test]
    fn only_the_refs_variant_mentions_citations() {
        assert!(default_prompt_with_refs().contains("[ref:"));
        assert!(!default_prompt().contains("[ref:"));
    }
}
