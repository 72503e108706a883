//! Default preprocess prompts, one per modality.
//!
//! Modalities without a default template (plain `text`, unknown values)
//! pass through preprocessing as a single raw segment.

use crate::types::Modality;

/// Conversation preprocess: rewrite plus topical segmentation.
///
/// The pipeline keeps the original indexed conversation authoritative; the
/// `<conversation>` block exists for model grounding and only the segments
/// JSON is consumed.
pub const CONVERSATION: &str = "\
# Task
You are given a conversation whose lines carry [index] markers. Split it into topically coherent segments.

# Output
First repeat the conversation:
<conversation>
...the conversation as given...
</conversation>

Then output a JSON object describing the segments by line index:
{{\"segments\": [{{\"start\": 0, \"end\": 4, \"caption\": \"optional 1-sentence topic\"}}]}}

Rules:
- Segment boundaries must fall on the given [index] values, inclusive on both ends.
- Cover every indexed line exactly once, in order.
- Prefer 2-5 segments; use one segment when the conversation has a single topic.

# Conversation
{conversation}";

/// Document preprocess: condense and caption.
pub const DOCUMENT: &str = "\
# Task
Condense the document below, keeping every fact a long-term memory system might need. Then write a one-sentence caption.

# Output
<processed_content>
...condensed document...
</processed_content>
<caption>...one sentence...</caption>

# Document
{document_text}";

/// Audio preprocess: clean a transcription and caption it.
pub const AUDIO: &str = "\
# Task
The text below is an audio transcription. Clean it up (fix obvious transcription artifacts, keep the speaker's meaning) and write a one-sentence caption.

# Output
<processed_content>
...cleaned transcription...
</processed_content>
<caption>...one sentence...</caption>

# Transcription
{transcription}";

/// Image preprocess: vision description and caption.
pub const IMAGE: &str = "\
# Task
Describe the image for a long-term memory system.

# Output
<detailed_description>
...everything noteworthy: people, objects, setting, text, activity...
</detailed_description>
<caption>...one sentence...</caption>";

/// Video preprocess: applied to an extracted representative frame.
pub const VIDEO: &str = "\
# Task
The image is a representative frame from a video. Describe what the video appears to show.

# Output
<detailed_description>
...scene, participants, activity, any visible text...
</detailed_description>
<caption>...one sentence...</caption>";

/// The built-in preprocess template for a modality, when one exists.
pub fn default_preprocess_prompt(modality: &Modality) -> Option<&'static str> {
    match modality {
        Modality::Conversation => Some(CONVERSATION),
        Modality::Document => Some(DOCUMENT),
        Modality::Audio => Some(AUDIO),
        Modality::Image => Some(IMAGE),
        Modality::Video => Some(VIDEO),
        Modality::Text | Modality::Other(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_unknown_modalities_have_no_template() {
        assert!(default_preprocess_prompt(&Modality::Text).is_none());
        assert!(default_preprocess_prompt(&Modality::Other("screencast".to_string())).is_none());
    }

    #[test]
    fn templates_carry_their_slots() {
        assert!(CONVERSATION.contains("{conversation}"));
        assert!(DOCUMENT.contains("{document_text}"));
        assert!(AUDIO.contains("{transcription}"));
    }
}
