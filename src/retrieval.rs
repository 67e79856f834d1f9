//! Hybrid ranking of vector-search candidates.
//!
//! Pure vector similarity under-ranks short, keyword-dense answers such as
//! `체크인: 15:00` against longer chunks that are merely about the same
//! topic. Candidates sharing a keyword with the query get a flat bonus plus
//! a proportional one; candidates sharing none are penalised.

use crate::vector_store::ScoredChunk;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const STRIPPED_PUNCTUATION: [char; 4] = ['?', '.', ',', '!'];

const MATCH_BONUS: f32 = 0.25;
const MATCH_WEIGHT: f32 = 0.15;
const NO_MATCH_FACTOR: f32 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum DictionaryError {
    #[error("failed to read synonym file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid synonym file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Canonical term → expansion terms. Matching is by substring so inflected
/// or compound tokens ("체크인은", "와이파이비번") still trigger a group.
#[derive(Debug, Clone, PartialEq)]
pub struct SynonymDictionary {
    entries: Vec<(String, Vec<String>)>,
}

impl Default for SynonymDictionary {
    /// Korean lodging FAQ vocabulary.
    fn default() -> Self {
        Self::new([
            ("체크인", vec!["입실", "들어가는", "도착"]),
            ("체크아웃", vec!["퇴실", "나가는", "떠나는"]),
            ("와이파이", vec!["wifi", "인터넷", "비밀번호", "패스워드"]),
            ("주차", vec!["주차장", "자동차", "차량"]),
            ("맛집", vec!["식당", "음식", "레스토랑", "먹을"]),
        ])
    }
}

impl SynonymDictionary {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, vs)| {
                    (
                        k.into().to_lowercase(),
                        vs.into_iter().map(|v| v.into().to_lowercase()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Loads a `{ "term": ["synonym", ...] }` JSON object.
    pub fn from_json_file(path: &Path) -> Result<Self, DictionaryError> {
        let raw = std::fs::read_to_string(path)?;
        let map: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)?;
        Ok(Self::new(map))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds every group triggered by `keywords`, keeping first-seen order.
    pub fn expand(&self, keywords: &[String]) -> Vec<String> {
        let mut expanded: Vec<String> = Vec::new();
        let mut add = |term: &str| {
            if !expanded.iter().any(|e| e == term) {
                expanded.push(term.to_string());
            }
        };
        for keyword in keywords {
            add(keyword);
        }
        for (canonical, synonyms) in &self.entries {
            let triggered = keywords.iter().any(|kw| {
                kw.contains(canonical.as_str()) || synonyms.iter().any(|s| kw.contains(s.as_str()))
            });
            if triggered {
                add(canonical);
                for synonym in synonyms {
                    add(synonym);
                }
            }
        }
        expanded
    }
}

/// Lowercased query tokens with punctuation stripped; single characters dropped.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
        .collect();
    let mut keywords: Vec<String> = Vec::new();
    for token in cleaned.split_whitespace() {
        if token.chars().count() > 1 && !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

/// Fraction of `keywords` found anywhere in `text`, case-insensitively.
pub fn keyword_score(text: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let text = text.to_lowercase();
    let matches = keywords
        .iter()
        .filter(|kw| text.contains(kw.to_lowercase().as_str()))
        .count();
    matches as f32 / keywords.len() as f32
}

/// Ranking score; not a probability and may exceed 1.0.
pub fn hybrid_score(similarity: f32, keyword_score: f32) -> f32 {
    if keyword_score > 0.0 {
        similarity + (MATCH_BONUS + keyword_score * MATCH_WEIGHT)
    } else {
        similarity * NO_MATCH_FACTOR
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedChunk {
    #[serde(flatten)]
    pub chunk: ScoredChunk,
    pub keyword_score: f32,
    pub hybrid_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct HybridScorer {
    dictionary: SynonymDictionary,
}

impl HybridScorer {
    pub fn new(dictionary: SynonymDictionary) -> Self {
        Self { dictionary }
    }

    pub fn expanded_keywords(&self, query: &str) -> Vec<String> {
        self.dictionary.expand(&extract_keywords(query))
    }

    /// Scores every candidate and sorts by hybrid score, descending. Equal
    /// scores fall back to chunk id so the order is reproducible.
    pub fn rank(&self, query: &str, candidates: Vec<ScoredChunk>) -> Vec<RankedChunk> {
        let keywords = self.expanded_keywords(query);
        let mut ranked: Vec<RankedChunk> = candidates
            .into_iter()
            .map(|chunk| {
                let keyword_score = keyword_score(&chunk.content, &keywords);
                RankedChunk {
                    hybrid_score: hybrid_score(chunk.similarity, keyword_score),
                    keyword_score,
                    chunk,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.hybrid_score
                .total_cmp(&a.hybrid_score)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        tracing::debug!(
            keywords = keywords.len(),
            candidates = ranked.len(),
            "ranked retrieval candidates"
        );
        ranked
    }
}
