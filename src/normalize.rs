//! Article Normalizer & Dedup (C2): turns a parsed feed entry into the
//! canonical Raw Article fields — entities, `story_fingerprint`,
//! `exact_hash`, `simhash` — logically co-located with the poller (C1) but
//! kept as its own module since the contract is explicitly replaceable
//! (entity extraction in particular).

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::types::{Entity, EntityType};
use crate::utils::is_stop_word;

/// `extract(title, body) -> [Entity]`. Uses capitalization + stopword
/// filtering; an upgrade path to a statistical NER model stays open since
/// callers depend on this free function, not a struct, so swapping the
/// implementation later does not ripple through the clustering call sites.
pub fn extract_entities(title: &str, body: &str) -> Vec<Entity> {
    let mut scores: HashMap<String, (f64, EntityType)> = HashMap::new();

    score_capitalized_spans(title, true, &mut scores);
    score_capitalized_spans(body, false, &mut scores);

    let mut entities: Vec<Entity> = scores
        .into_iter()
        .map(|(text, (salience, entity_type))| Entity { text, entity_type, salience })
        .collect();

    entities.sort_by(|a, b| b.salience.partial_cmp(&a.salience).unwrap());
    entities.truncate(10);
    entities
}

fn score_capitalized_spans(text: &str, in_title: bool, scores: &mut HashMap<String, (f64, EntityType)>) {
    let words: Vec<&str> = text.split_whitespace().collect();
    let len = words.len().max(1);

    let mut i = 0;
    while i < words.len() {
        let w = words[i].trim_matches(|c: char| !c.is_alphanumeric());
        if w.len() >= 2 && w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) && !is_stop_word(&w.to_lowercase()) {
            // greedily extend into a multi-word span of capitalized tokens.
            let start = i;
            let mut j = i + 1;
            while j < words.len() {
                let next = words[j].trim_matches(|c: char| !c.is_alphanumeric());
                if next.len() >= 2 && next.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
                    j += 1;
                } else {
                    break;
                }
            }
            let span: String = words[start..j]
                .iter()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .collect::<Vec<_>>()
                .join(" ");

            if !span.is_empty() {
                let earliness_decay = 1.0 - (start as f64 / len as f64) * 0.8;
                let mut salience = earliness_decay * 0.5;
                if in_title {
                    salience += 1.0;
                }
                let token_count = span.split_whitespace().count();
                if token_count >= 2 {
                    salience += 0.2;
                }

                let entity_type = classify_entity(&span);
                let entry = scores.entry(span).or_insert((0.0, entity_type));
                if salience > entry.0 {
                    entry.0 = salience;
                    entry.1 = entity_type;
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
}

const ORG_SUFFIXES: &[&str] = &["Inc", "Corp", "Corporation", "Ltd", "LLC", "Co", "Group", "Agency", "Organization", "Party", "Union"];
const LOC_HINTS: &[&str] = &["City", "County", "Province", "State", "Island", "River", "Mountain"];

fn classify_entity(span: &str) -> EntityType {
    if ORG_SUFFIXES.iter().any(|s| span.ends_with(s)) {
        EntityType::Org
    } else if LOC_HINTS.iter().any(|s| span.ends_with(s)) {
        EntityType::Loc
    } else if span.split_whitespace().count() <= 3 {
        EntityType::Person
    } else {
        EntityType::Other
    }
}

/// Top-N normalized content words for the fingerprint, ranked by a simple
/// frequency-over-stopwords filter.
pub fn top_keywords(title: &str, description: Option<&str>, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let text = format!("{} {}", title, description.unwrap_or(""));
    for word in text.to_lowercase().split_whitespace() {
        let w = word.trim_matches(|c: char| !c.is_alphanumeric());
        if w.len() > 3 && !is_stop_word(w) {
            *counts.entry(w.to_string()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

/// 8-char digest over six normalized keywords plus 2-3 top entities
/// (prioritizing PERSON/ORG over LOC), used as the clustering fast path.
pub fn story_fingerprint(title: &str, description: Option<&str>, entities: &[Entity]) -> String {
    let keywords = top_keywords(title, description, 6);

    let mut priority_entities: Vec<&Entity> = entities.iter().collect();
    priority_entities.sort_by(|a, b| {
        entity_priority(a.entity_type)
            .cmp(&entity_priority(b.entity_type))
            .then_with(|| b.salience.partial_cmp(&a.salience).unwrap())
    });

    let top_entities: Vec<String> = priority_entities
        .into_iter()
        .take(3)
        .map(|e| e.text.to_lowercase())
        .collect();

    let mut basis = keywords;
    basis.extend(top_entities);
    basis.sort();
    basis.dedup();

    let joined = basis.join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn entity_priority(t: EntityType) -> u8 {
    match t {
        EntityType::Person => 0,
        EntityType::Org => 0,
        EntityType::Loc => 1,
        EntityType::Event => 1,
        EntityType::Other => 2,
    }
}

/// Stable document id for a Raw Article, derived from `(feed_id, url)` so
/// re-ingesting the same entry after a restart upserts onto the same
/// document instead of minting a second one (P8).
pub fn article_id(feed_id: uuid::Uuid, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(feed_id.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hex_prefix(&hasher.finalize(), 32)
}

/// SHA-256 over normalized title + source domain, for exact-duplicate
/// detection of wire-syndicated republications.
pub fn exact_hash(title: &str, source_domain: &str) -> String {
    let normalized = title.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(source_domain.as_bytes());
    hex_prefix(&hasher.finalize(), 32)
}

fn hex_prefix(bytes: &[u8], hex_chars: usize) -> String {
    let byte_len = (hex_chars + 1) / 2;
    bytes[..byte_len.min(bytes.len())]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(hex_chars)
        .collect()
}

/// 64-bit SimHash over 3-shingles of `title + description`. Hamming
/// distance <= 3 between two simhashes is the near-duplicate threshold.
pub fn simhash(title: &str, description: Option<&str>) -> u64 {
    let text = format!("{} {}", title, description.unwrap_or(""));
    let normalized: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let normalized: String = normalized.into_iter().collect();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let shingles: HashSet<String> = if tokens.len() < 3 {
        tokens.windows(1.max(tokens.len())).map(|w| w.join(" ")).collect()
    } else {
        tokens.windows(3).map(|w| w.join(" ")).collect()
    };

    let mut weights = [0i64; 64];
    for shingle in &shingles {
        let hash = fnv1a_64(shingle.as_bytes());
        for bit in 0..64 {
            if (hash >> bit) & 1 == 1 {
                weights[bit] += 1;
            } else {
                weights[bit] -= 1;
            }
        }
    }

    let mut result: u64 = 0;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            result |= 1 << bit;
        }
    }
    result
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// URL path slugs checked before falling back to keyword scoring; listed in
/// the same category order as `clustering::TOPIC_GROUPS` so the two stay in
/// lockstep.
const URL_PATH_HINTS: &[(&str, &[&str])] = &[
    ("crime_violence", &["/crime", "/police"]),
    ("medical_health", &["/health", "/medical"]),
    ("politics", &["/politics", "/election"]),
    ("sports", &["/sport", "/sports"]),
    ("business", &["/business", "/markets", "/finance", "/money"]),
    ("weather", &["/weather", "/climate"]),
    ("entertainment", &["/entertainment", "/arts", "/celebrity"]),
    ("tech", &["/tech", "/technology", "/science"]),
    ("world", &["/world", "/international"]),
];

fn categorize_by_url_path(url: &str) -> Option<&'static str> {
    let path = url::Url::parse(url).ok()?.path().to_lowercase();
    URL_PATH_HINTS
        .iter()
        .find(|(_, slugs)| slugs.iter().any(|s| path.starts_with(s) || path.contains(&format!("{}/", s))))
        .map(|(category, _)| *category)
}

fn categorize_by_keywords(title: &str, description: Option<&str>) -> Option<&'static str> {
    let text = format!("{} {}", title, description.unwrap_or("")).to_lowercase();
    crate::clustering::TOPIC_GROUPS
        .iter()
        .map(|(category, keywords)| (*category, keywords.iter().filter(|k| text.contains(**k)).count()))
        .filter(|(_, score)| *score > 0)
        .max_by_key(|(_, score)| *score)
        .map(|(category, _)| category)
}

/// Assigns a category: URL-path heuristics first, then a weighted keyword
/// score over title+description, then the feed's configured hint, then
/// `"general"`. Ties between the URL and keyword signals favor the URL
/// signal since it is checked first and returned immediately on a hit.
pub fn categorize(url: &str, title: &str, description: Option<&str>, category_hint: Option<&str>) -> String {
    if let Some(cat) = categorize_by_url_path(url) {
        return cat.to_string();
    }
    if let Some(cat) = categorize_by_keywords(title, description) {
        return cat.to_string();
    }
    category_hint.map(|s| s.to_string()).unwrap_or_else(|| "general".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_titles_produce_identical_fingerprint() {
        let entities = extract_entities("Earthquake Strikes Japan", "A Magnitude 7.2 earthquake hit Hokkaido Japan");
        let fp1 = story_fingerprint("Earthquake Strikes Japan", Some("breaking news"), &entities);
        let fp2 = story_fingerprint("Earthquake Strikes Japan", Some("breaking news"), &entities);
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 8);
    }

    #[test]
    fn exact_hash_ignores_whitespace_differences() {
        let h1 = exact_hash("Quake  hits   Japan", "reuters.com");
        let h2 = exact_hash("Quake hits Japan", "reuters.com");
        assert_eq!(h1, h2);
    }

    #[test]
    fn exact_hash_differs_by_source() {
        let h1 = exact_hash("Quake hits Japan", "reuters.com");
        let h2 = exact_hash("Quake hits Japan", "bbc.com");
        assert_ne!(h1, h2);
    }

    #[test]
    fn simhash_near_identical_titles_within_hamming_threshold() {
        let s1 = simhash("Magnitude 7.2 earthquake off Hokkaido", Some("A powerful quake struck northern Japan"));
        let s2 = simhash("Magnitude 7.2 earthquake off Hokkaido coast", Some("A powerful quake struck northern Japan today"));
        assert!(hamming_distance(s1, s2) <= 3, "distance was {}", hamming_distance(s1, s2));
    }

    #[test]
    fn simhash_unrelated_titles_exceed_threshold() {
        let s1 = simhash("Magnitude 7.2 earthquake off Hokkaido", Some("A powerful quake struck northern Japan"));
        let s2 = simhash("Local bakery wins county fair ribbon", Some("Small business celebrates third consecutive win"));
        assert!(hamming_distance(s1, s2) > 3);
    }

    #[test]
    fn entity_extraction_prioritizes_title_entities() {
        let entities = extract_entities("Tokyo Officials Respond", "Meanwhile Osaka also reported minor damage");
        let tokyo = entities.iter().find(|e| e.text == "Tokyo").unwrap();
        let osaka = entities.iter().find(|e| e.text == "Osaka").unwrap();
        assert!(tokyo.salience > osaka.salience);
    }
}
