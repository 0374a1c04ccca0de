//! Search-term extraction from free-text queries.
//!
//! A pure function of the query text: no I/O, no model calls. Produces an
//! ordered, deduplicated sequence of salient terms for the similarity
//! search engine. Empty output is valid — a query made entirely of
//! stopwords simply searches with zero terms.

/// Words carrying no retrieval signal for spending queries.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "i", "me", "my", "we", "our", "you", "your", "it", "its", "is", "am", "are",
    "was", "were", "be", "been", "do", "did", "does", "have", "has", "had", "how", "what", "when",
    "where", "which", "who", "why", "much", "many", "and", "or", "but", "if", "of", "on", "in",
    "at", "to", "for", "from", "by", "with", "about", "into", "over", "under", "this", "that",
    "these", "those", "there", "here", "all", "any", "each", "show", "tell", "give", "get", "list",
    "please", "can", "could", "would", "should", "will",
];

/// Extract salient search terms from a raw query, in order of appearance.
///
/// Tokenizes on non-alphanumeric boundaries, lowercases, drops stopwords
/// and single-character tokens, and deduplicates while preserving first
/// occurrence order. Adjacent surviving tokens are also emitted as a bigram
/// so multi-word merchant names ("trader joes") stay intact as one term.
pub fn extract(query: &str) -> Vec<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect();

    let mut terms: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (i, token) in tokens.iter().enumerate() {
        if seen.insert(token.clone()) {
            terms.push(token.clone());
        }
        // Bigram over consecutive survivors
        if i + 1 < tokens.len() {
            let bigram = format!("{} {}", token, tokens[i + 1]);
            if seen.insert(bigram.clone()) {
                terms.push(bigram);
            }
        }
    }

    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_salient_terms_in_order() {
        let terms = extract("How much did I spend on groceries last month?");
        assert!(terms.contains(&"spend".to_string()));
        assert!(terms.contains(&"groceries".to_string()));
        let spend_pos = terms.iter().position(|t| t == "spend").unwrap();
        let groc_pos = terms.iter().position(|t| t == "groceries").unwrap();
        assert!(spend_pos < groc_pos);
    }

    #[test]
    fn stopword_only_query_yields_empty() {
        assert!(extract("how much is it?").is_empty());
        assert!(extract("").is_empty());
        assert!(extract("   ").is_empty());
    }

    #[test]
    fn merchant_bigram_preserved() {
        let terms = extract("total at trader joes in march");
        assert!(terms.contains(&"trader joes".to_string()));
    }

    #[test]
    fn duplicates_collapsed() {
        let terms = extract("coffee coffee coffee");
        assert_eq!(
            terms
                .iter()
                .filter(|t| t.as_str() == "coffee")
                .count(),
            1
        );
    }

    #[test]
    fn punctuation_and_case_normalized() {
        let terms = extract("UBER, uber; Uber!");
        assert_eq!(terms, vec!["uber".to_string(), "uber uber".to_string()]);
    }
}
