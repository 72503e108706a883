//! Default extraction prompts, one per memory type.
//!
//! Each prompt asks the model for an XML document whose root tag matches
//! the memory type (`profile`, `events`, ...) containing `<memory>` entries
//! with `<content>` and `<categories>` children. The `{resource}` and
//! `{categories_str}` slots are filled per segment.

use crate::types::MemoryType;

const PROFILE_OBJECTIVE: &str = "\
# Task Objective
You extract durable profile facts about the user from the provided resource: identity, demographics, location, occupation, and stable personal attributes. Extract only facts stated or strongly implied by the resource.";

const EVENT_OBJECTIVE: &str = "\
# Task Objective
You extract events from the provided resource: things that happened to the user or that the user did, anchored to a point or span of time when one is given.";

const KNOWLEDGE_OBJECTIVE: &str = "\
# Task Objective
You extract knowledge the user holds or shares in the provided resource: facts, domain information, and learned material worth remembering on the user's behalf.";

const BEHAVIOR_OBJECTIVE: &str = "\
# Task Objective
You extract behaviors from the provided resource: habits, routines, recurring patterns, and characteristic ways the user acts or communicates.";

const SKILL_OBJECTIVE: &str = "\
# Task Objective
You extract skills from the provided resource: abilities, competencies, and proficiencies the user demonstrates or claims.";

const SHARED_WORKFLOW: &str = "\
# Workflow
1. Read the resource carefully.
2. Identify each distinct memory of this type. Merge restatements of the same fact into one memory.
3. Write each memory as a single self-contained sentence in third person (\"The user ...\").
4. Assign each memory to one or more of the provided categories by exact name.";

const SHARED_RULES: &str = "\
# Rules
- Only extract memories supported by the resource text. Never invent details.
- Each memory must stand alone without the surrounding conversation.
- Use only category names from the provided list; skip a category assignment rather than inventing a name.
- If the resource contains no memories of this type, output the root element with no children.";

const SHARED_EXAMPLES: &str = "\
# Example
<memory>
    <content>The user drinks two cups of coffee every morning.</content>
    <categories>
        <category>habits</category>
        <category>preferences</category>
    </categories>
</memory>";

const SHARED_INPUT: &str = "\
# Input
Available categories:
{categories_str}

Resource:
{resource}";

fn output_block(root: &str) -> String {
    format!(
        "# Output Format\n\
         Respond with XML only, no prose before or after:\n\
         <{root}>\n\
         \x20   <memory>\n\
         \x20       <content>one self-contained memory sentence</content>\n\
         \x20       <categories>\n\
         \x20           <category>category name</category>\n\
         \x20       </categories>\n\
         \x20   </memory>\n\
         </{root}>"
    )
}

fn objective(memory_type: MemoryType) -> &'static str {
    match memory_type {
        MemoryType::Profile => PROFILE_OBJECTIVE,
        MemoryType::Event => EVENT_OBJECTIVE,
        MemoryType::Knowledge => KNOWLEDGE_OBJECTIVE,
        MemoryType::Behavior => BEHAVIOR_OBJECTIVE,
        MemoryType::Skill => SKILL_OBJECTIVE,
    }
}

/// Default block set for one memory type, in canonical block order.
pub fn default_blocks(memory_type: MemoryType) -> Vec<(&'static str, String)> {
    vec![
        ("objective", objective(memory_type).to_string()),
        ("workflow", SHARED_WORKFLOW.to_string()),
        ("rules", SHARED_RULES.to_string()),
        ("output", output_block(memory_type.xml_root_tag())),
        ("examples", SHARED_EXAMPLES.to_string()),
        ("input", SHARED_INPUT.to_string()),
    ]
}

/// Generic block set for caller-defined types, using the `item` root tag.
pub fn generic_blocks() -> Vec<(&'static str, String)> {
    vec![
        (
            "objective",
            "# Task Objective\nYou extract memories of the requested type from the provided resource."
                .to_string(),
        ),
        ("workflow", SHARED_WORKFLOW.to_string()),
        ("rules", SHARED_RULES.to_string()),
        ("output", output_block("item")),
        ("examples", SHARED_EXAMPLES.to_string()),
        ("input", SHARED_INPUT.to_string()),
    ]
}

/// The fully composed default prompt for one memory type.
pub fn default_prompt(memory_type: MemoryType) -> String {
    default_blocks(memory_type)
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n\n")
}
