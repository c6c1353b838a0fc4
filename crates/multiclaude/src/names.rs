//! Human-memorable agent names (`adjective-animal`).

use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
  "agile", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
  "fancy", "fierce", "gentle", "happy", "hardy", "jolly", "keen", "kind", "lively", "lucky",
  "mellow", "merry", "mighty", "nimble", "noble", "plucky", "polite", "proud", "quick", "quiet",
  "rapid", "sharp", "shiny", "silent", "sleek", "smart", "snappy", "steady", "sunny", "swift",
  "tidy", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
  "badger", "beaver", "bison", "bobcat", "cougar", "coyote", "crane", "dingo", "dolphin",
  "eagle", "falcon", "ferret", "finch", "fox", "gecko", "heron", "ibex", "jackal", "koala",
  "lemur", "lynx", "marmot", "meerkat", "moose", "narwhal", "ocelot", "otter", "owl", "panda",
  "pelican", "puffin", "quokka", "raven", "robin", "salmon", "seal", "sparrow", "tapir",
  "tiger", "walrus", "weasel", "wombat", "yak", "zebra",
];

/// Random attempts before falling back to a numeric suffix.
const MAX_RANDOM_ATTEMPTS: usize = 64;

fn random_pair() -> (usize, usize) {
  let bytes = Uuid::new_v4().into_bytes();
  let a = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
  let b = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
  (a % ADJECTIVES.len(), b % ANIMALS.len())
}

/// Generate a name for which `taken` returns false.
///
/// Tries random `adjective-animal` pairs first. If all of those collide, appends
/// the lowest free numeric suffix to the last candidate:
/// - `calm-otter` taken -> `calm-otter2`
/// - `calm-otter`, `calm-otter2` taken -> `calm-otter3`
pub fn generate_unique(taken: impl Fn(&str) -> bool) -> String {
  let mut candidate = String::new();
  for _ in 0..MAX_RANDOM_ATTEMPTS {
    let (a, b) = random_pair();
    candidate = format!("{}-{}", ADJECTIVES[a], ANIMALS[b]);
    if !taken(&candidate) {
      return candidate;
    }
  }
  with_free_suffix(&candidate, taken)
}

/// First of `base`, `base2`, `base3`, ... not reported as taken.
pub fn with_free_suffix(base: &str, taken: impl Fn(&str) -> bool) -> String {
  if !taken(base) {
    return base.to_string();
  }
  let mut n: u64 = 2;
  loop {
    let candidate = format!("{base}{n}");
    if !taken(&candidate) {
      return candidate;
    }
    n = n.saturating_add(1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn generated_names_are_two_words() {
    let name = generate_unique(|_| false);
    let parts: Vec<&str> = name.split('-').collect();
    assert_eq!(parts.len(), 2);
    assert!(ADJECTIVES.contains(&parts[0]));
    assert!(ANIMALS.contains(&parts[1]));
  }

  #[test]
  fn generated_names_avoid_taken_set() {
    let mut taken: HashSet<String> = HashSet::new();
    for _ in 0..200 {
      let name = generate_unique(|n| taken.contains(n));
      assert!(taken.insert(name), "duplicate name generated");
    }
  }

  #[test]
  fn falls_back_to_suffix_when_everything_is_taken() {
    let name = generate_unique(|n| !n.ends_with('2'));
    assert!(name.ends_with('2'), "got {name}");
  }

  #[test]
  fn suffix_skips_taken_numbers() {
    let taken: HashSet<&str> = ["calm-otter", "calm-otter2", "calm-otter3"].into();
    assert_eq!(with_free_suffix("calm-otter", |n| taken.contains(n)), "calm-otter4");
    assert_eq!(with_free_suffix("free", |n| taken.contains(n)), "free");
  }
}
