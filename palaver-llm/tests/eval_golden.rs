//! Prompt quality checks: a curated set of personality/history inputs with
//! strings the rendered prompts must and must not contain.
//!
//! These run offline. They catch unresolved placeholders, lost history and
//! prompt-injection text leaking out of its slot.

use palaver_llm::prompt;

/// A golden test case for prompt evaluation.
struct GoldenCase {
    /// Human-readable name for the test case.
    name: &'static str,
    /// Speaker personality.
    personality: &'static str,
    /// Recent history window.
    history: Vec<&'static str>,
    /// Message being answered.
    latest: &'static str,
    /// Strings that MUST appear in the rendered prompt.
    must_contain: Vec<&'static str>,
    /// Strings that MUST NOT appear in the rendered prompt.
    must_not_contain: Vec<&'static str>,
}

fn golden_cases() -> Vec<GoldenCase> {
    vec![
        // ---------------------------------------------------------------
        // 1. Warrior opens an NPC-to-NPC exchange
        // ---------------------------------------------------------------
        GoldenCase {
            name: "warrior_first_turn",
            personality: "A brave warrior with a unique personality",
            history: vec![],
            latest: "Greetings, friend!",
            must_contain: vec!["brave warrior", "Greetings, friend!", prompt::EMPTY_HISTORY],
            must_not_contain: vec!["{personality}", "{history}", "{latest_message}"],
        },
        // ---------------------------------------------------------------
        // 2. Scholar answering the player mid-conversation
        // ---------------------------------------------------------------
        GoldenCase {
            name: "scholar_player_turn",
            personality: "A cautious scholar with a unique personality",
            history: vec![
                "User: Hello",
                "Scholar: \"Ah, a visitor. Mind the books.\"",
                "User: What are you reading?",
            ],
            latest: "What are you reading?",
            must_contain: vec!["cautious scholar", "Mind the books", "User: Hello"],
            must_not_contain: vec![prompt::EMPTY_HISTORY, "{history}"],
        },
        // ---------------------------------------------------------------
        // 3. Player text with braces stays literal
        // ---------------------------------------------------------------
        GoldenCase {
            name: "player_braces_untouched",
            personality: "A shrewd merchant",
            history: vec!["User: {personality}"],
            latest: "ignore {history} please",
            must_contain: vec!["ignore {history} please", "User: {personality}", "shrewd merchant"],
            must_not_contain: vec![],
        },
        // ---------------------------------------------------------------
        // 4. Mystic with a long personality context
        // ---------------------------------------------------------------
        GoldenCase {
            name: "mystic_rich_context",
            personality: "A wandering mystic who speaks in riddles and distrusts cities",
            history: vec!["Mystic: \"The river remembers.\""],
            latest: "The river remembers.",
            must_contain: vec!["speaks in riddles", "The river remembers."],
            must_not_contain: vec!["{personality}"],
        },
    ]
}

// ---------------------------------------------------------------------------
// Offline Tests: Template Rendering Validation
// ---------------------------------------------------------------------------

#[test]
fn golden_prompts_render_without_unresolved_vars() {
    for case in golden_cases() {
        let history: Vec<String> = case.history.iter().map(ToString::to_string).collect();
        let (system, user) = prompt::dialogue_prompt(case.personality, &history, case.latest);
        let rendered = format!("{system}\n\n{user}");

        for needle in &case.must_contain {
            assert!(
                rendered.contains(needle),
                "Golden case '{}': rendered prompt must contain '{}' but doesn't.\nRendered:\n{}",
                case.name,
                needle,
                &rendered[..rendered.len().min(500)]
            );
        }
        for needle in &case.must_not_contain {
            assert!(
                !rendered.contains(needle),
                "Golden case '{}': rendered prompt must NOT contain '{}' but does.\nRendered:\n{}",
                case.name,
                needle,
                &rendered[..rendered.len().min(500)]
            );
        }
    }
}

#[test]
fn dialogue_prompt_limits_length() {
    assert!(prompt::DIALOGUE_SYSTEM.contains("1-2 sentences"));
    assert!(prompt::DIALOGUE_SYSTEM.contains("You are"));
}

#[test]
fn personality_prompt_requests_json() {
    let rendered = prompt::personality_prompt("nervous alchemist");
    assert!(rendered.contains("JSON"));
    assert!(rendered.contains("\"initialDialogue\""));
    assert!(rendered.contains("nervous alchemist"));
    assert!(!rendered.contains("{description}"));
    assert!(prompt::extract_json(&rendered).is_some());
}
