//! Query DSL tokenizer and parser (spec §4.8).
//!
//! ```text
//! query       := token (WS token)*
//! token       := topic | metadata | quoted | fuzzy | score | word
//! topic       := "topic:" path
//! metadata    := "metadata:" key "=" value
//! quoted      := "\"" any-except-quote* "\""
//! fuzzy       := "fuzzy~" word
//! score       := "score>" float
//! word        := [^\s"]+
//! ```
//!
//! Unprefixed words join with spaces into the default (BM25) text search;
//! a quoted token overrides that to exact-mode and takes precedence over
//! any `fuzzy~` clause. Unknown prefixes (e.g. `foo:bar`) fall back to
//! plain words.

use crate::engine::TextSearchMode;

/// A single metadata equality clause: `metadata:key=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    pub key: String,
    pub value: String,
}

/// The default (unprefixed) text search clause, in whichever mode the
/// query implied: exact if a quoted phrase was present, fuzzy if a
/// `fuzzy~term` clause was present and no quote overrode it, otherwise the
/// DSL's default BM25 token search over the joined plain words.
#[derive(Debug, Clone, PartialEq)]
pub struct TextClause {
    pub text: String,
    pub mode: TextSearchMode,
}

/// A fully parsed, immutable query. Constructed only by [`parse`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub topic_filter: Vec<String>,
    pub metadata_filters: Vec<MetadataFilter>,
    pub text_search: Option<TextClause>,
    pub min_score: Option<f32>,
}

/// Tokenize a raw query string, preserving double-quoted runs as a single
/// token (including their quotes). An unterminated quote consumes the rest
/// of the input as one token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if chars[i] == '"' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i < chars.len() {
                i += 1; // consume closing quote
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        tokens.push(chars[start..i].iter().collect());
    }
    tokens
}

/// Parse a raw query string into a [`ParsedQuery`].
///
/// Plain words accumulate and join (space-separated) into the default text
/// search clause unless overridden by a quoted phrase. A `fuzzy~` clause
/// only becomes the text search when no quoted phrase is present — per
/// spec §4.8, `"quoted"` takes precedence over any fuzzy/plain text.
pub fn parse(input: &str) -> ParsedQuery {
    let mut topic_filter = Vec::new();
    let mut metadata_filters = Vec::new();
    let mut min_score = None;
    let mut quoted_text: Option<String> = None;
    let mut fuzzy_text: Option<String> = None;
    let mut plain_words: Vec<String> = Vec::new();

    for token in tokenize(input) {
        if let Some(rest) = token.strip_prefix("topic:") {
            if !rest.is_empty() {
                topic_filter.push(rest.to_string());
            }
            continue;
        }
        if let Some(rest) = token.strip_prefix("metadata:") {
            if let Some((k, v)) = rest.split_once('=') {
                metadata_filters.push(MetadataFilter {
                    key: k.to_string(),
                    value: v.to_string(),
                });
                continue;
            }
            // `metadata:` without `=value` has no well-formed clause; fall
            // through and treat the whole token as a plain word.
        }
        if let Some(rest) = token.strip_prefix("fuzzy~") {
            if !rest.is_empty() {
                fuzzy_text = Some(rest.to_string());
                continue;
            }
        }
        if let Some(rest) = token.strip_prefix("score>") {
            if let Ok(v) = rest.parse::<f32>() {
                min_score = Some(v);
                continue;
            }
        }
        if token.starts_with('"') {
            let inner = token.trim_matches('"');
            quoted_text = Some(match quoted_text {
                Some(existing) => format!("{existing} {inner}"),
                None => inner.to_string(),
            });
            continue;
        }
        plain_words.push(token);
    }

    let text_search = if let Some(text) = quoted_text {
        Some(TextClause {
            text,
            mode: TextSearchMode::Exact,
        })
    } else if let Some(text) = fuzzy_text {
        Some(TextClause {
            text,
            mode: TextSearchMode::Fuzzy,
        })
    } else if !plain_words.is_empty() {
        Some(TextClause {
            text: plain_words.join(" "),
            mode: TextSearchMode::Bm25,
        })
    } else {
        None
    };

    ParsedQuery {
        topic_filter,
        metadata_filters,
        text_search,
        min_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topic_and_metadata_and_quoted_and_score() {
        let q = parse(r#"topic:work metadata:pri=high "urgent fix" score>0.6"#);
        assert_eq!(q.topic_filter, vec!["work".to_string()]);
        assert_eq!(
            q.metadata_filters,
            vec![MetadataFilter {
                key: "pri".to_string(),
                value: "high".to_string()
            }]
        );
        assert_eq!(
            q.text_search,
            Some(TextClause {
                text: "urgent fix".to_string(),
                mode: TextSearchMode::Exact
            })
        );
        assert_eq!(q.min_score, Some(0.6));
    }

    #[test]
    fn plain_words_join_into_bm25_default() {
        let q = parse("fix the login bug");
        assert_eq!(
            q.text_search,
            Some(TextClause {
                text: "fix the login bug".to_string(),
                mode: TextSearchMode::Bm25
            })
        );
    }

    #[test]
    fn fuzzy_clause_used_only_when_no_quoted_phrase() {
        let q = parse("fuzzy~helo");
        assert_eq!(
            q.text_search,
            Some(TextClause {
                text: "helo".to_string(),
                mode: TextSearchMode::Fuzzy
            })
        );

        let q2 = parse(r#"fuzzy~helo "exact phrase""#);
        assert_eq!(
            q2.text_search,
            Some(TextClause {
                text: "exact phrase".to_string(),
                mode: TextSearchMode::Exact
            })
        );
    }

    #[test]
    fn unterminated_quote_consumes_rest_of_input() {
        let q = parse(r#""unterminated phrase"#);
        assert_eq!(
            q.text_search,
            Some(TextClause {
                text: "unterminated phrase".to_string(),
                mode: TextSearchMode::Exact
            })
        );
    }

    #[test]
    fn unknown_prefix_falls_back_to_plain_word() {
        let q = parse("foo:bar");
        assert_eq!(
            q.text_search,
            Some(TextClause {
                text: "foo:bar".to_string(),
                mode: TextSearchMode::Bm25
            })
        );
    }

    #[test]
    fn empty_query_has_no_text_search() {
        let q = parse("   ");
        assert_eq!(q.text_search, None);
        assert!(q.topic_filter.is_empty());
    }
}
