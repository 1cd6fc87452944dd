//! Prompt normalization and the fixed "surprise me" sample set.

use rand::Rng;

/// Longest raw prompt considered, matching the form's entry cap. Anything
/// past this is dropped silently rather than rejected.
pub const MAX_PROMPT_CHARS: usize = 200;

/// Built-in sample prompts for the "surprise me" affordance.
const SAMPLE_PROMPTS: &[&str] = &[
    "A red apple on a wooden table, photorealistic",
    "A lighthouse on a cliff at sunset, oil painting",
    "A cozy cabin in a snowy forest, warm light in the windows",
    "An astronaut riding a horse on the moon, digital art",
    "A steaming cup of coffee next to an open book, soft morning light",
    "A koi pond with cherry blossoms floating on the surface",
];

/// Normalizes raw user input into a resolved prompt: the first
/// [`MAX_PROMPT_CHARS`] characters, trimmed, with internal whitespace runs
/// collapsed to single spaces. An empty result is a valid output and is
/// handled by the caller.
pub fn normalize(raw: &str) -> String {
    let capped: String = raw.chars().take(MAX_PROMPT_CHARS).collect();
    capped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fixed, ordered set of example prompts. Defined once, never mutated.
#[derive(Debug, Clone)]
pub struct SamplePrompts {
    prompts: Vec<String>,
}

impl Default for SamplePrompts {
    fn default() -> Self {
        Self::new(SAMPLE_PROMPTS.iter().map(|s| s.to_string()))
    }
}

impl SamplePrompts {
    /// Builds a set from already-written prompts. Entries are normalized on
    /// the way in; if nothing usable remains, the built-in set is used so
    /// that [`SamplePrompts::pick`] stays total.
    pub fn new(prompts: impl IntoIterator<Item = String>) -> Self {
        let prompts: Vec<String> = prompts
            .into_iter()
            .map(|p| normalize(&p))
            .filter(|p| !p.is_empty())
            .collect();
        if prompts.is_empty() {
            return Self::default();
        }
        Self { prompts }
    }

    /// Picks a member uniformly at random.
    pub fn pick(&self) -> &str {
        let idx = rand::thread_rng().gen_range(0..self.prompts.len());
        &self.prompts[idx]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.prompts
    }
}
