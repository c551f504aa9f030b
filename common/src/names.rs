//! Random two-part instance names, docker-style.

use rand::seq::IndexedRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "cosmic", "crisp", "eager", "fancy", "gentle",
    "happy", "jolly", "keen", "lively", "lucid", "mellow", "nimble", "polite", "proud", "quiet",
    "rapid", "shiny", "solid", "sunny", "swift", "tidy", "vivid", "warm", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "falcon", "otter", "badger", "heron", "lynx", "marmot", "osprey", "panda", "puffin", "quokka",
    "raven", "seal", "shrew", "stork", "tapir", "toucan", "viper", "walrus", "weasel", "wombat",
    "bison", "condor", "dingo", "egret", "ferret", "gecko", "ibis", "jackal", "koala", "lemur",
];

/// Generate an adjective-noun name not present in `taken`. Falls back to a
/// numeric suffix if the namespace is exhausted (practically unreachable).
pub fn random_name(taken: &[String]) -> String {
    let mut rng = rand::rng();
    for _ in 0..64 {
        let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"brisk");
        let noun = NOUNS.choose(&mut rng).unwrap_or(&"otter");
        let candidate = format!("{adjective}-{noun}");
        if !taken.iter().any(|t| t == &candidate) {
            return candidate;
        }
    }
    let mut n = 0u32;
    loop {
        let candidate = format!("instance-{n}");
        if !taken.iter().any(|t| t == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avoids_taken_names() {
        let mut taken: Vec<String> = Vec::new();
        for _ in 0..32 {
            let name = random_name(&taken);
            assert!(!taken.contains(&name));
            assert!(name.contains('-'));
            taken.push(name);
        }
    }
}
