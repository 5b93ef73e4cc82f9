//! Text similarity for the semantic delta threshold and merge detection.
//!
//! Sørensen–Dice coefficient over character bigrams of the lowercased,
//! whitespace-collapsed text.

use std::collections::HashMap;

/// Collapse whitespace runs to a single space, trim, lowercase
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bigrams(text: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

/// Similarity in 0.0..=1.0; identical normalized texts score 1.0
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    if a == b {
        return 1.0;
    }
    if a.chars().count() < 2 || b.chars().count() < 2 {
        return 0.0;
    }

    let left = bigrams(&a);
    let right = bigrams(&b);
    let total: usize = left.values().sum::<usize>() + right.values().sum::<usize>();

    let shared: usize = left
        .iter()
        .map(|(gram, count)| (*count).min(*right.get(gram).unwrap_or(&0)))
        .sum();

    (2 * shared) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_after_normalization() {
        assert_eq!(text_similarity("Turn  left here", "turn left here "), 1.0);
    }

    #[test]
    fn test_disjoint_texts() {
        assert_eq!(text_similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_small_edit_stays_high() {
        let score = text_similarity(
            "turn left here at the second junction",
            "turn left here at the second junction.",
        );
        assert!(score > 0.95, "score was {}", score);
    }

    #[test]
    fn test_rewrite_drops_below_threshold() {
        let score = text_similarity("turn left here", "take the exit after the bridge");
        assert!(score < 0.5, "score was {}", score);
    }

    #[test]
    fn test_symmetric() {
        let a = "merge sort splits the list";
        let b = "merge sort splits lists in half";
        assert_eq!(text_similarity(a, b), text_similarity(b, a));
    }
}
