//! Personality rule table: acceptance odds and opening lines.
//!
//! NPC personalities are free-form text. The table below maps keywords found
//! in that text (case-insensitive substring, first rule wins, table order is
//! the priority order) to a handshake acceptance probability and to pools of
//! opening lines. Everything here is pure so it can be tested in isolation.

use rand::Rng;
use rand::seq::SliceRandom;

/// One row of the personality table.
#[derive(Debug)]
pub struct PersonalityRule {
    /// Keywords; any one matching selects this rule.
    pub keywords: &'static [&'static str],
    /// Probability of accepting a handshake request.
    pub acceptance: f64,
    /// Opening lines toward another NPC. `{listener}` is substituted.
    pub greetings: &'static [&'static str],
    /// Opening lines toward the player.
    pub intros: &'static [&'static str],
}

/// Acceptance probability when no keyword matches.
pub const DEFAULT_ACCEPTANCE: f64 = 0.7;

/// Priority-ordered personality table.
pub const RULES: &[PersonalityRule] = &[
    PersonalityRule {
        keywords: &["warrior", "battle"],
        acceptance: 0.8,
        greetings: &[
            "Hail, {listener}! Care to hear how my last battle went?",
            "{listener}, you look like someone who can hold a blade.",
            "Stand easy, {listener}. Even a warrior needs a rest.",
        ],
        intros: &[
            "Well met, traveler. Keep your guard up around here.",
            "Another face on the road. Can you fight, stranger?",
            "Speak plainly, friend. I have little patience for riddles.",
        ],
    },
    PersonalityRule {
        keywords: &["scholar", "knowledge"],
        acceptance: 0.9,
        greetings: &[
            "Ah, {listener}! I have been reading something fascinating.",
            "{listener}, have you ever wondered why the stars move as they do?",
            "Good day, {listener}. Might I trouble you with a question?",
        ],
        intros: &[
            "Greetings! Are you here to learn something, or to teach it?",
            "Oh, a visitor. I was just making some notes. What brings you?",
            "Knowledge is best shared. What would you like to know?",
        ],
    },
    PersonalityRule {
        keywords: &["mystic", "fortune"],
        acceptance: 0.6,
        greetings: &[
            "{listener}... the signs said you would come this way.",
            "Your aura is restless today, {listener}.",
            "Sit a moment, {listener}. The cards have something for you.",
        ],
        intros: &[
            "I foresaw a stranger today. It seems the vision was true.",
            "Your fate hangs in a curious balance, traveler.",
            "Come closer. The veil is thin this hour.",
        ],
    },
    PersonalityRule {
        keywords: &["gardener", "nature"],
        acceptance: 0.85,
        greetings: &[
            "{listener}! The roses finally bloomed, come see.",
            "Lovely weather for the seedlings, isn't it, {listener}?",
            "Mind the moss, {listener}. It took me years to grow.",
        ],
        intros: &[
            "Hello there! Careful where you step, the herbs are sprouting.",
            "Welcome, friend. Do you smell the lavender?",
            "A fine day to be outside, don't you think?",
        ],
    },
    PersonalityRule {
        keywords: &["merchant", "business"],
        acceptance: 0.7,
        greetings: &[
            "{listener}, my friend! Have I got a deal for you.",
            "Business is slow today, {listener}. Any news from the road?",
            "{listener}! You still owe me for that lantern.",
        ],
        intros: &[
            "Welcome, welcome! Finest goods this side of the river.",
            "Looking to buy or to sell, traveler?",
            "Ah, a customer! Let me show you what I have.",
        ],
    },
    PersonalityRule {
        keywords: &["artist", "creative"],
        acceptance: 0.75,
        greetings: &[
            "{listener}, hold still! The light on you is perfect.",
            "I've been stuck on this piece all morning, {listener}.",
            "What colour is your mood today, {listener}?",
        ],
        intros: &[
            "Oh! You have an interesting face. Has anyone painted you?",
            "Welcome, stranger. Inspiration comes from unexpected places.",
            "Hello! Do you see beauty here, or only rubble?",
        ],
    },
    PersonalityRule {
        keywords: &["sailor", "adventure"],
        acceptance: 0.8,
        greetings: &[
            "Ahoy, {listener}! Smell that wind? A storm's coming.",
            "{listener}, did I ever tell you about the sea serpent?",
            "Fair winds, {listener}. Where are you bound?",
        ],
        intros: &[
            "Ahoy there! You have the look of someone who's travelled.",
            "Hello, friend. Every stranger has a story. What's yours?",
            "Land-lubber, eh? Still, welcome aboard.",
        ],
    },
    PersonalityRule {
        keywords: &["blacksmith", "craft"],
        acceptance: 0.65,
        greetings: &[
            "{listener}. That hinge of yours still squeak?",
            "Busy at the forge, {listener}, but I can spare a minute.",
            "{listener}, you know good steel when you see it.",
        ],
        intros: &[
            "Need something mended? Speak up over the hammer.",
            "Good iron, honest work. What can I do for you?",
            "Mind the sparks, stranger.",
        ],
    },
    PersonalityRule {
        keywords: &["night", "philosopher"],
        acceptance: 0.6,
        greetings: &[
            "{listener}, do you think the night watches us back?",
            "A question for you, {listener}: what is a promise worth?",
            "Quiet evening, {listener}. Good for thinking.",
        ],
        intros: &[
            "Ah, a wanderer. Tell me, what do you seek out here?",
            "Strange hour for a stroll. Or perhaps the right one.",
            "Every meeting is a small mystery, don't you think?",
        ],
    },
    PersonalityRule {
        keywords: &["noble", "refined"],
        acceptance: 0.7,
        greetings: &[
            "Good day, {listener}. I trust you are keeping well.",
            "{listener}, how fortunate. I was hoping for civil company.",
            "Do walk with me a moment, {listener}.",
        ],
        intros: &[
            "Greetings. You may address me with appropriate courtesy.",
            "How do you do, traveler? One meets so few polite people here.",
            "Welcome. Do mind your manners.",
        ],
    },
];

/// Opening lines toward another NPC when no rule matches.
pub const DEFAULT_GREETINGS: &[&str] = &[
    "Hello, {listener}! Nice day, isn't it?",
    "Oh, {listener}! I was hoping to run into you.",
    "{listener}, how have you been?",
    "Hey {listener}, heard any news lately?",
];

/// Opening lines toward the player when no rule matches.
pub const DEFAULT_INTROS: &[&str] = &[
    "Hello there! How can I help you?",
    "Greetings! Nice to meet you.",
    "Well, well, what brings you here?",
];

/// Line an NPC says to the player when a reply cannot be generated.
pub const GENERATION_FALLBACK_LINE: &str = "I'm sorry, I can't respond right now. Please try again.";

/// Generic filler lines for UI-level fallbacks.
pub const FALLBACK_LINES: &[&str] = &[
    "That's interesting! Tell me more.",
    "I see what you mean.",
    "Well, that's quite something!",
    "I hadn't thought of it that way.",
    "You make a good point.",
    "That reminds me of something...",
    "I'm not sure about that, but it's worth considering.",
    "You seem to know what you're talking about.",
    "I'd love to hear more about that.",
    "That's a perspective I hadn't considered.",
];

/// Descriptions used for the randomly populated roster.
pub const DESCRIPTION_POOL: &[&str] = &[
    "mysterious stranger",
    "friendly traveler",
    "wise elder",
    "cheerful merchant",
    "serious guard",
    "playful child",
    "brave warrior",
    "cautious scholar",
    "energetic bard",
    "calm monk",
    "adventurous explorer",
    "traditional craftsman",
];

/// Trait keywords NPCs draw from.
pub const TRAIT_POOL: &[&str] = &[
    "friendly",
    "curious",
    "helpful",
    "mysterious",
    "wise",
    "cheerful",
    "serious",
    "playful",
    "brave",
    "cautious",
    "creative",
    "logical",
    "energetic",
    "calm",
    "adventurous",
    "traditional",
    "innovative",
    "loyal",
];

/// First rule whose keyword occurs in `personality`.
#[must_use]
pub fn matching_rule(personality: &str) -> Option<&'static PersonalityRule> {
    let lowered = personality.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k)))
}

/// Probability that an NPC with this personality accepts a handshake.
#[must_use]
pub fn acceptance_probability(personality: &str) -> f64 {
    matching_rule(personality).map_or(DEFAULT_ACCEPTANCE, |rule| rule.acceptance)
}

/// Bernoulli draw against [`acceptance_probability`].
pub fn decide_acceptance<R: Rng + ?Sized>(personality: &str, rng: &mut R) -> bool {
    rng.gen_bool(acceptance_probability(personality))
}

/// Opening lines toward another NPC for this personality.
#[must_use]
pub fn greeting_pool(personality: &str) -> &'static [&'static str] {
    matching_rule(personality).map_or(DEFAULT_GREETINGS, |rule| rule.greetings)
}

/// Opening lines toward the player for this personality.
#[must_use]
pub fn intro_pool(personality: &str) -> &'static [&'static str] {
    matching_rule(personality).map_or(DEFAULT_INTROS, |rule| rule.intros)
}

/// Substitute `{listener}` in a template.
#[must_use]
pub fn render_line(template: &str, listener: &str) -> String {
    template.replace("{listener}", listener)
}

/// A random filler line.
pub fn random_fallback<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    FALLBACK_LINES.choose(rng).copied().unwrap_or(GENERATION_FALLBACK_LINE)
}

/// Two to four distinct traits from [`TRAIT_POOL`].
pub fn random_traits<R: Rng + ?Sized>(rng: &mut R) -> Vec<String> {
    let count = rng.gen_range(2..=4);
    TRAIT_POOL
        .choose_multiple(rng, count)
        .map(|t| (*t).to_string())
        .collect()
}
