//! Prompt templates for Palaver generation calls.
//!
//! Templates use `{key}` placeholders filled by [`render_template`]. Literal
//! braces in JSON examples are written doubled and collapse on render.

/// Persona and rules for an in-character reply.
pub const DIALOGUE_SYSTEM: &str = r"You are a game NPC with the following personality: {personality}

Instructions:
- Respond in character as this NPC would
- Keep responses conversational and natural
- Limit to 1-2 sentences maximum
- Stay true to your personality traits
- Be engaging and immersive for the player";

/// The turn to answer.
pub const DIALOGUE_USER: &str = r"Current conversation context: {latest_message}
Recent dialogue history:
{history}

Generate your response:";

/// Character sheet generation for a user-described NPC.
pub const PERSONALITY_USER: &str = r#"Create a detailed personality for a game NPC based on this description: "{description}"

Please provide a JSON response with the following structure:
{{
  "name": "A fitting name for this character",
  "description": "A brief description of their personality and role",
  "traits": ["trait1", "trait2", "trait3"],
  "initialDialogue": [
    "First thing they might say when encountered",
    "Alternative greeting",
    "Another possible opening line"
  ],
  "background": "A brief background story for this character"
}}

Make the character interesting, memorable, and fitting for the description.
The dialogue should be natural and engaging."#;

/// Placeholder used when there is no history yet.
pub const EMPTY_HISTORY: &str = "(none yet)";

/// Simple template interpolation for prompts.
///
/// Replaces `{key}` with the corresponding value and collapses doubled
/// braces in the template. Substituted values are copied verbatim and
/// unknown keys are left as written.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(i) = rest.find(|c: char| c == '{' || c == '}') {
        result.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            result.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{') {
            if let Some(close) = tail.find('}') {
                let key = &tail[1..close];
                if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                    result.push_str(value);
                    rest = &tail[close + 1..];
                    continue;
                }
            }
        }
        result.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    result.push_str(rest);
    result
}

/// Render the (system, user) pair for a dialogue reply.
#[must_use]
pub fn dialogue_prompt(
    personality_context: &str,
    recent_history: &[String],
    latest_message: &str,
) -> (String, String) {
    let history = if recent_history.is_empty() {
        EMPTY_HISTORY.to_string()
    } else {
        recent_history.join("\n")
    };
    (
        render_template(DIALOGUE_SYSTEM, &[("personality", personality_context)]),
        render_template(
            DIALOGUE_USER,
            &[("latest_message", latest_message), ("history", &history)],
        ),
    )
}

/// Render the personality generation prompt.
#[must_use]
pub fn personality_prompt(description: &str) -> String {
    render_template(PERSONALITY_USER, &[("description", description)])
}

/// The outermost `{...}` span of a reply, if any.
///
/// Models often wrap JSON in prose or code fences.
#[must_use]
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
