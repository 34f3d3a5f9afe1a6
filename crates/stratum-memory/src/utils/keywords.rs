//! Query keyword extraction for memory relevance scoring

use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "this", "that", "these",
        "those", "what", "when", "where", "which", "about", "from", "into",
        "over", "after", "before", "between", "there", "here", "then", "than",
    ]
    .iter()
    .copied()
    .collect();
}

/// Minimum length for a word to count as a keyword.
pub const MIN_KEYWORD_LENGTH: usize = 3;

/// Extract lowercase keywords from a query: words longer than
/// [`MIN_KEYWORD_LENGTH`] that are not stop words, deduplicated in order of
/// first appearance.
pub fn extract_query_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for word in query.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        if cleaned.len() <= MIN_KEYWORD_LENGTH || STOP_WORDS.contains(cleaned.as_str()) {
            continue;
        }
        if seen.insert(cleaned.clone()) {
            keywords.push(cleaned);
        }
    }

    keywords
}

/// Check if a word is a stop word
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_significant_words() {
        let keywords = extract_query_keywords("What did we decide about the deployment pipeline?");
        assert_eq!(keywords, vec!["decide", "deployment", "pipeline"]);
    }

    #[test]
    fn test_short_and_stop_words_filtered() {
        assert!(extract_query_keywords("is it a he or the and").is_empty());
        // "api" has exactly 3 chars and must be filtered (length > 3 required)
        assert!(extract_query_keywords("api").is_empty());
        assert_eq!(extract_query_keywords("apis"), vec!["apis"]);
    }

    #[test]
    fn test_deduplicates_preserving_order() {
        let keywords = extract_query_keywords("budget review budget REVIEW");
        assert_eq!(keywords, vec!["budget", "review"]);
    }

    #[test]
    fn test_punctuation_stripped() {
        let keywords = extract_query_keywords("pricing, invoices; contract!");
        assert_eq!(keywords, vec!["pricing", "invoices", "contract"]);
    }
}
