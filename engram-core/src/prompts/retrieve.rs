//! Default prompts for the retrieve pipeline: the sufficiency check and the
//! three LLM rankers.

/// System prompt for the retrieval decision / sufficiency check.
pub const SUFFICIENCY_SYSTEM_PROMPT: &str = "\
You decide whether a conversational agent needs to retrieve (more) long-term memory to answer the user, and you rewrite the query to be self-contained for the next retrieval step.";

/// User prompt for the retrieval decision / sufficiency check.
///
/// Slots: `{query}`, `{conversation_history}`, `{retrieved_content}`.
pub const SUFFICIENCY_USER_PROMPT: &str = "\
# Current query
{query}

# Conversation context
{conversation_history}

# Content retrieved so far
{retrieved_content}

# Task
Decide whether the retrieved content already suffices to answer the query.
- If it suffices, or the query needs no memory at all (small talk, general knowledge), answer NO_RETRIEVE.
- Otherwise answer RETRIEVE and rewrite the query so the next retrieval step can run on it alone: resolve pronouns from the conversation context and name what is still missing.

# Output Format
<decision>RETRIEVE or NO_RETRIEVE</decision>
<rewritten_query>the rewritten query</rewritten_query>";

/// LLM category ranker. Slots: `{query}`, `{top_k}`, `{categories_data}`.
pub const CATEGORY_RANKER_PROMPT: &str = "\
# Task
Rank the memory categories below by relevance to the query and return the top {top_k}.

# Query
{query}

# Categories
{categories_data}

# Output Format
JSON only: {{\"categories\": [\"<id>\", ...]}} ordered most relevant first. Use only ids that appear above.";

/// LLM item ranker. Slots: `{query}`, `{top_k}`, `{relevant_categories}`,
/// `{items_data}`.
pub const ITEM_RANKER_PROMPT: &str = "\
# Task
Rank the memory items below by relevance to the query and return the top {top_k}.

# Query
{query}

# Relevant categories
{relevant_categories}

# Memory items
{items_data}

# Output Format
JSON only: {{\"items\": [\"<id>\", ...]}} ordered most relevant first. Use only ids that appear above.";

/// LLM resource ranker. Slots: `{query}`, `{top_k}`, `{context_info}`,
/// `{resources_data}`.
pub const RESOURCE_RANKER_PROMPT: &str = "\
# Task
Rank the resources below by relevance to the query and return the top {top_k}.

# Query
{query}

# Context
{context_info}

# Resources
{resources_data}

# Output Format
JSON only: {{\"resources\": [\"<id>\", ...]}} ordered most relevant first. Use only ids that appear above.";
