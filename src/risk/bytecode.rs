//! Advisory keyword heuristics over on-chain code
//!
//! Matches are hints only. They add flags to a signal but never move the
//! score.

use regex::bytes::{Regex, RegexBuilder};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Keywords found in a token's code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeFindings {
    pub matched: BTreeSet<String>,
}

impl CodeFindings {
    pub fn is_clean(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Case-insensitive keyword matcher over raw bytes
#[derive(Debug, Clone)]
pub struct KeywordScanner {
    pattern: Option<Regex>,
}

impl KeywordScanner {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }

        let pattern = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .unicode(false)
            .build()
            .map_err(|e| Error::Config(format!("Invalid bytecode keyword pattern: {}", e)))?;

        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn scan(&self, code: &[u8]) -> CodeFindings {
        let matched = match &self.pattern {
            Some(pattern) => pattern
                .find_iter(code)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).to_lowercase())
                .collect(),
            None => BTreeSet::new(),
        };
        CodeFindings { matched }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_is_case_insensitive_and_deduplicated() {
        let scanner = KeywordScanner::new(&["blacklist", "setFee"]).unwrap();
        let findings = scanner.scan(b"\x00\x01BlackList..SETFEE..blacklist\xff");
        assert_eq!(
            findings.matched.into_iter().collect::<Vec<_>>(),
            vec!["blacklist".to_string(), "setfee".to_string()]
        );
    }

    #[test]
    fn test_empty_keywords_match_nothing() {
        let scanner = KeywordScanner::new::<&str>(&[]).unwrap();
        assert!(scanner.scan(b"blacklist").is_clean());
    }

    #[test]
    fn test_keywords_are_escaped() {
        let scanner = KeywordScanner::new(&["a.b"]).unwrap();
        assert!(scanner.scan(b"axb").is_clean());
        assert!(!scanner.scan(b"a.b").is_clean());
    }

    #[test]
    fn test_configured_keywords() {
        let keywords = crate::config::ScoringConfig::default().bytecode_keywords;
        let findings = KeywordScanner::new(&keywords)
            .unwrap()
            .scan(b"function pause() onlyOwner");
        assert!(findings.matched.contains("pause"));
        assert!(findings.matched.contains("onlyowner"));
    }
}
