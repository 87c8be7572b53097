// src/broker/wildcard.rs

//! Topic pattern matching over dot-separated routing keys.
//!
//! `*` matches exactly one word, `#` matches zero or more words.

pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // Either `#` swallows nothing, or it swallows one more word.
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) => p == k && match_words(&pattern[1..], &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_one_word() {
        assert!(topic_matches("svc.event.*", "svc.event.X"));
        assert!(!topic_matches("svc.event.*", "svc.event"));
        assert!(!topic_matches("svc.event.*", "svc.event.a.b"));
        assert!(!topic_matches("svc.manager.*", "svc.event.X"));
    }

    #[test]
    fn hash_matches_any_tail() {
        assert!(topic_matches("svc.#", "svc"));
        assert!(topic_matches("svc.#", "svc.event.a.b"));
        assert!(topic_matches("#.b", "a.b"));
        assert!(!topic_matches("svc.#.z", "svc.a.b"));
    }

    #[test]
    fn literal_keys_match_exactly() {
        assert!(topic_matches("svc.manager.node-1", "svc.manager.node-1"));
        assert!(!topic_matches("svc.manager.node-1", "svc.manager.node-2"));
    }
}
