//! Placeholder display names for sessions that have not sent a Hello yet.

use std::sync::{Mutex, OnceLock, PoisonError};

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

const ADJECTIVES: &[&str] = &[
    "amber", "ash", "basalt", "brass", "cedar", "cobalt", "copper", "coral", "crimson", "dawn",
    "dusk", "ember", "fern", "flint", "frost", "garnet", "glacier", "granite", "hazel", "indigo",
    "iron", "jade", "juniper", "lunar", "maple", "marble", "misty", "nimble", "obsidian", "onyx",
    "pebble", "pine", "quartz", "quick", "rapid", "river", "rust", "sable", "silver", "slate",
    "solar", "storm", "swift", "thistle", "thunder", "topaz", "velvet", "willow",
];

const NOUNS: &[&str] = &[
    "antler", "badger", "bard", "beacon", "bison", "crane", "crow", "falcon", "fang", "ferret",
    "fox", "gecko", "griffin", "hare", "hawk", "heron", "hound", "jackal", "keeper", "lantern",
    "lynx", "marten", "moth", "newt", "otter", "owl", "panther", "pilgrim", "raven", "rider",
    "sage", "scribe", "seeker", "sparrow", "stag", "talon", "tinker", "voyager", "walker",
    "warden", "weaver", "wolf", "wren", "yak",
];

static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn rng() -> &'static Mutex<StdRng> {
    RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Builds a name shaped like `Hawkcopper Otter`.
///
/// All callers share one generator seeded from OS entropy the first time a
/// name is requested, so bursts of joins do not produce correlated names.
pub fn generate() -> String {
    let mut rng = rng().lock().unwrap_or_else(PoisonError::into_inner);
    let first = pick(NOUNS, &mut rng);
    let adjective = pick(ADJECTIVES, &mut rng);
    let second = pick(NOUNS, &mut rng);
    format!("{}{} {}", capitalize(first), adjective, capitalize(second))
}

fn pick(words: &'static [&'static str], rng: &mut StdRng) -> &'static str {
    words.choose(rng).copied().unwrap_or("anonymous")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn names_have_two_capitalized_words() {
        let name = generate();
        let words: Vec<&str> = name.split(' ').collect();
        assert_eq!(words.len(), 2, "unexpected name {name}");
        for word in words {
            assert!(word.chars().next().is_some_and(char::is_uppercase));
        }
    }

    #[test]
    fn rapid_generation_is_not_stuck_on_one_value() {
        let names: HashSet<String> = (0..64).map(|_| generate()).collect();
        assert!(names.len() > 1);
    }

    #[test]
    fn capitalize_handles_empty_input() {
        assert_eq!(capitalize(""), "");
        assert_eq!(capitalize("owl"), "Owl");
    }
}
