//! Request, response and structured-output types.

use serde::{Deserialize, Serialize};

/// A request to a text generation backend.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    /// System prompt (persona and rules). May be empty.
    pub system: String,
    /// User prompt.
    pub user: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f32,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl LlmRequest {
    /// A short in-character reply: low temperature, 150 tokens.
    #[must_use]
    pub fn dialogue(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 150,
            temperature: 0.1,
            timeout_ms: 10_000,
        }
    }

    /// A longer structured generation, such as a personality sheet.
    #[must_use]
    pub fn structured(user: impl Into<String>) -> Self {
        Self {
            system: String::new(),
            user: user.into(),
            max_tokens: 512,
            temperature: 0.8,
            timeout_ms: 15_000,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set sampling parameters.
    #[must_use]
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// System and user prompt joined for single-prompt backends.
    #[must_use]
    pub fn combined_prompt(&self) -> String {
        if self.system.is_empty() {
            self.user.clone()
        } else {
            format!("{}\n\n{}", self.system, self.user)
        }
    }
}

/// A response from a text generation backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    /// The generated text, trimmed.
    pub text: String,
    /// Tokens generated, when the backend reports it.
    pub tokens_generated: u32,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// Which model answered.
    pub model: String,
}

/// A generated character sheet for a new NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityData {
    /// Display name.
    pub name: String,
    /// Personality and role summary.
    pub description: String,
    /// Trait keywords.
    #[serde(default)]
    pub traits: Vec<String>,
    /// Opening lines.
    #[serde(default)]
    pub initial_dialogue: Vec<String>,
    /// Short backstory.
    #[serde(default)]
    pub background: String,
}

impl PersonalityData {
    /// The sheet used when generation fails: name from the first word of the
    /// description, stock traits and greetings.
    #[must_use]
    pub fn fallback(description: &str) -> Self {
        let name = description
            .split_whitespace()
            .next()
            .map(|word| {
                let mut chars = word.chars();
                chars
                    .next()
                    .map(|c| c.to_uppercase().chain(chars).collect::<String>())
                    .unwrap_or_default()
            })
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "NPC".to_string());

        Self {
            name,
            description: format!("A {description} with a unique personality"),
            traits: vec!["friendly".into(), "curious".into(), "helpful".into()],
            initial_dialogue: vec![
                format!("Hello there! I'm a {description}. How can I help you?"),
                "Greetings! Nice to meet you.".into(),
                "Well, well, what brings you here?".into(),
            ],
            background: format!("This character is a {description} with an interesting past."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_personality_shape() {
        let p = PersonalityData::fallback("grumpy blacksmith");
        assert_eq!(p.name, "Grumpy");
        assert_eq!(p.description, "A grumpy blacksmith with a unique personality");
        assert_eq!(p.traits.len(), 3);
        assert_eq!(p.initial_dialogue.len(), 3);
        assert!(p.initial_dialogue[0].contains("grumpy blacksmith"));
    }

    #[test]
    fn fallback_for_blank_description() {
        assert_eq!(PersonalityData::fallback("   ").name, "NPC");
    }

    #[test]
    fn personality_parses_camel_case() {
        let json = r#"{"name":"Mira","description":"a healer","traits":["kind"],"initialDialogue":["Hi"],"background":"b"}"#;
        let p: PersonalityData = serde_json::from_str(json).expect("valid");
        assert_eq!(p.initial_dialogue, vec!["Hi".to_string()]);
    }

    #[test]
    fn combined_prompt_skips_empty_system() {
        assert_eq!(LlmRequest::structured("u").combined_prompt(), "u");
        assert_eq!(LlmRequest::dialogue("s", "u").combined_prompt(), "s\n\nu");
    }
}
