//! Retrieval engine: semantic and hybrid search with reranking.
//!
//! # Pipeline
//!
//! 1. Validate the query (non-empty text, `k >= 1`, threshold in `[0, 1]`).
//! 2. Embed the query text.
//! 3. Over-fetch `k × overfetch_factor` neighbours under the caller's filter.
//! 4. Similarity = `1 − distance`, clamped to `[0, 1]`.
//! 5. Drop candidates below `similarity_threshold`.
//! 6. Hybrid mode only: `base = semantic × semantic_weight + keyword × keyword_weight`,
//!    where `keyword` is the fraction of query tokens found in the chunk.
//! 7. Multiply by each entry of [`ADJUSTMENTS`], in declared order.
//! 8. Sort by score (desc), then `chunk_id` (asc).
//! 9. Keep the best chunk per source unless chunk-level results were asked for.
//! 10. Truncate to `k` and extract a snippet for each result.
//!
//! # Adjustments
//!
//! | Name | Multiplier |
//! |------|------------|
//! | `title_match` | `title_boost` (1.2) if the query appears in the title, else 1 |
//! | `quality` | `1 + (quality_score − 5) / 10`, neutral when absent |
//! | `recency` | linear from 1.0 at age 0 to `recency_floor` (0.4) at `recency_window_days` (365); no date means age 0 |
//!
//! Each adjustment is a plain function of the candidate and the query
//! context, so each can be tested on its own.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::embedding::EmbeddingGateway;
use crate::error::{IndexError, Result};
use crate::models::{keys, tokenize, ChunkRecord, Metadata, MetadataValue};
use crate::store::{MetadataFilter, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(IndexError::InvalidQuery(format!(
                "unknown search mode '{}', use semantic or hybrid",
                other
            ))),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semantic => f.write_str("semantic"),
            Self::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Ranking and retrieval tuning.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Result count when the query gives none.
    pub default_k: usize,
    pub default_mode: SearchMode,
    pub similarity_threshold: f32,
    pub overfetch_factor: usize,
    pub title_boost: f32,
    pub recency_floor: f32,
    pub recency_window_days: u32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Snippet length limit, in characters.
    pub snippet_max_len: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            default_mode: SearchMode::Semantic,
            similarity_threshold: 0.0,
            overfetch_factor: 3,
            title_boost: 1.2,
            recency_floor: 0.4,
            recency_window_days: 365,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            snippet_max_len: 240,
        }
    }
}

/// A search request. Unset fields take the engine's defaults.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    pub filter: Option<MetadataFilter>,
    pub k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub mode: Option<SearchMode>,
    /// Return several chunks of the same document instead of the best one.
    pub chunk_level: bool,
    /// Attach a score breakdown to each result.
    pub explain: bool,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn chunk_level(mut self, chunk_level: bool) -> Self {
        self.chunk_level = chunk_level;
        self
    }

    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub source_id: String,
    pub score: f32,
    pub snippet: String,
    pub metadata: Metadata,
    /// 1-based position in the result list.
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

impl SearchResult {
    pub fn title(&self) -> Option<&str> {
        self.metadata.get(keys::TITLE).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentFactor {
    pub name: &'static str,
    pub multiplier: f32,
}

/// Scoring breakdown for a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreExplanation {
    pub similarity: f32,
    /// Keyword overlap, hybrid mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<f32>,
    /// Score before adjustments.
    pub base: f32,
    pub adjustments: Vec<AdjustmentFactor>,
}

/// A candidate flowing through the reranker.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    /// Semantic similarity in `[0, 1]`.
    pub similarity: f32,
    pub keyword: Option<f32>,
    pub score: f32,
    pub adjustments: Vec<AdjustmentFactor>,
}

impl ScoredChunk {
    pub fn new(record: ChunkRecord, similarity: f32) -> Self {
        Self {
            record,
            similarity,
            keyword: None,
            score: similarity,
            adjustments: Vec::new(),
        }
    }
}

/// Query-wide inputs shared by every adjustment.
pub struct QueryContext<'a> {
    /// Trimmed, lowercased query text.
    pub text: String,
    pub tokens: Vec<String>,
    pub now: DateTime<Utc>,
    pub ranking: &'a RankingConfig,
}

impl<'a> QueryContext<'a> {
    pub fn new(text: &str, now: DateTime<Utc>, ranking: &'a RankingConfig) -> Self {
        let mut tokens = tokenize(text);
        let mut seen = HashSet::new();
        tokens.retain(|t| seen.insert(t.clone()));
        Self {
            text: text.trim().to_lowercase(),
            tokens,
            now,
            ranking,
        }
    }
}

pub type Adjustment = fn(&ScoredChunk, &QueryContext<'_>) -> f32;

/// Reranking multipliers, applied in this order.
pub const ADJUSTMENTS: [(&str, Adjustment); 3] = [
    ("title_match", title_match),
    ("quality", quality),
    ("recency", recency),
];

pub fn title_match(candidate: &ScoredChunk, ctx: &QueryContext<'_>) -> f32 {
    match candidate.record.title() {
        Some(title) if !ctx.text.is_empty() && title.to_lowercase().contains(&ctx.text) => {
            ctx.ranking.title_boost
        }
        _ => 1.0,
    }
}

pub fn quality(candidate: &ScoredChunk, _ctx: &QueryContext<'_>) -> f32 {
    let q = candidate
        .record
        .metadata
        .get(keys::QUALITY_SCORE)
        .and_then(MetadataValue::as_f64)
        .filter(|q| q.is_finite())
        .unwrap_or(5.0);
    (1.0 + (q as f32 - 5.0) / 10.0).max(0.0)
}

pub fn recency(candidate: &ScoredChunk, ctx: &QueryContext<'_>) -> f32 {
    let metadata = &candidate.record.metadata;
    let date = metadata
        .get(keys::UPDATED_AT)
        .and_then(parse_date)
        .or_else(|| metadata.get(keys::CREATED_AT).and_then(parse_date));

    let age_days = match date {
        Some(date) => ((ctx.now - date).num_seconds() as f32 / 86_400.0).max(0.0),
        None => 0.0,
    };
    recency_multiplier(age_days, ctx.ranking.recency_floor, ctx.ranking.recency_window_days)
}

/// Linear decay from 1.0 at age 0 to `floor` at `window_days` and beyond.
pub fn recency_multiplier(age_days: f32, floor: f32, window_days: u32) -> f32 {
    if age_days <= 0.0 {
        return 1.0;
    }
    let decayed = 1.0 - (1.0 - floor) * age_days / window_days.max(1) as f32;
    decayed.max(floor)
}

/// Accepts RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, or unix seconds.
pub fn parse_date(value: &MetadataValue) -> Option<DateTime<Utc>> {
    match value {
        MetadataValue::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
        MetadataValue::Float(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
        MetadataValue::Str(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt.and_utc());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        MetadataValue::Bool(_) => None,
    }
}

/// Fraction of distinct query tokens present in `text`.
pub fn keyword_score(text: &str, query_tokens: &[String]) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let present: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = query_tokens.iter().filter(|t| present.contains(*t)).count();
    hits as f32 / query_tokens.len() as f32
}

/// Hybrid blend, adjustments, ordering and per-source dedup.
pub fn rerank(
    mut candidates: Vec<ScoredChunk>,
    ctx: &QueryContext<'_>,
    mode: SearchMode,
    chunk_level: bool,
) -> Vec<ScoredChunk> {
    for candidate in candidates.iter_mut() {
        let base = match mode {
            SearchMode::Semantic => candidate.similarity,
            SearchMode::Hybrid => {
                let kw = keyword_score(&candidate.record.text, &ctx.tokens);
                candidate.keyword = Some(kw);
                candidate.similarity * ctx.ranking.semantic_weight + kw * ctx.ranking.keyword_weight
            }
        };

        let mut score = base;
        candidate.adjustments.clear();
        for (name, adjust) in ADJUSTMENTS {
            let multiplier = adjust(candidate, ctx);
            score *= multiplier;
            candidate.adjustments.push(AdjustmentFactor { name, multiplier });
        }
        candidate.score = score;
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.record.chunk_id.cmp(&b.record.chunk_id))
    });

    if !chunk_level {
        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.record.source_id.clone()));
    }
    candidates
}

/// Best sentence of `text` for the query, truncated to `max_len` chars.
///
/// Sentences are split on `.` and scored by how many distinct query tokens
/// they contain; ties go to the earliest sentence.
pub fn extract_snippet(text: &str, query_tokens: &[String], max_len: usize) -> String {
    let query: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

    let mut best: Option<(&str, usize)> = None;
    for sentence in text.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        let tokens: HashSet<String> = tokenize(sentence).into_iter().collect();
        let score = tokens.iter().filter(|t| query.contains(t.as_str())).count();
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((sentence, score)),
        }
    }

    let chosen = best.map(|(s, _)| s).unwrap_or_else(|| text.trim());
    truncate_chars(chosen, max_len)
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len).collect();
    format!("{}...", cut.trim_end())
}

pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn VectorIndex>,
    ranking: RankingConfig,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<dyn VectorIndex>,
        ranking: RankingConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            ranking,
        }
    }

    pub fn ranking(&self) -> &RankingConfig {
        &self.ranking
    }

    pub async fn search(&self, query: &Query) -> Result<Vec<SearchResult>> {
        self.search_at(query, Utc::now()).await
    }

    /// [`search`](Self::search) with an explicit clock for recency.
    pub async fn search_at(&self, query: &Query, now: DateTime<Utc>) -> Result<Vec<SearchResult>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(IndexError::InvalidQuery("query text is empty".into()));
        }
        let k = query.k.unwrap_or(self.ranking.default_k);
        if k == 0 {
            return Err(IndexError::InvalidQuery("k must be at least 1".into()));
        }
        let threshold = query
            .similarity_threshold
            .unwrap_or(self.ranking.similarity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(IndexError::InvalidQuery(format!(
                "similarity threshold {} is outside [0, 1]",
                threshold
            )));
        }
        let mode = query.mode.unwrap_or(self.ranking.default_mode);

        let vector = self
            .embedder
            .embed_query(text)
            .await
            .map_err(IndexError::Embedding)?;

        let fetch = k.saturating_mul(self.ranking.overfetch_factor.max(1));
        let hits = self
            .index
            .query(&vector, fetch, query.filter.as_ref())
            .await
            .map_err(|e| match e {
                IndexError::DimensionMismatch { .. } => e,
                other => IndexError::RetrievalUnavailable(other.to_string()),
            })?;

        let fetched = hits.len();
        let candidates: Vec<ScoredChunk> = hits
            .into_iter()
            .map(|hit| ScoredChunk::new(hit.record, (1.0 - hit.distance).clamp(0.0, 1.0)))
            .filter(|c| c.similarity >= threshold)
            .collect();

        let ctx = QueryContext::new(text, now, &self.ranking);
        let mut ranked = rerank(candidates, &ctx, mode, query.chunk_level);
        ranked.truncate(k);

        tracing::debug!(%mode, k, fetched, returned = ranked.len(), "search complete");

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let explain = query.explain.then(|| ScoreExplanation {
                    similarity: c.similarity,
                    keyword: c.keyword,
                    base: match c.keyword {
                        Some(kw) => {
                            c.similarity * self.ranking.semantic_weight
                                + kw * self.ranking.keyword_weight
                        }
                        None => c.similarity,
                    },
                    adjustments: c.adjustments.clone(),
                });
                SearchResult {
                    snippet: extract_snippet(&c.record.text, &ctx.tokens, self.ranking.snippet_max_len),
                    chunk_id: c.record.chunk_id,
                    source_id: c.record.source_id,
                    score: c.score,
                    metadata: c.record.metadata,
                    rank: i + 1,
                    explain,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn candidate(id: &str, source: &str, similarity: f32, meta: &[(&str, MetadataValue)]) -> ScoredChunk {
        let mut metadata = Metadata::new();
        for (k, v) in meta {
            metadata.insert(k.to_string(), v.clone());
        }
        ScoredChunk::new(
            ChunkRecord {
                chunk_id: id.into(),
                source_id: source.into(),
                vector: vec![],
                text: String::new(),
                metadata,
            },
            similarity,
        )
    }

    fn ids(ranked: &[ScoredChunk]) -> Vec<&str> {
        ranked.iter().map(|c| c.record.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_similarity_order_preserved() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("neural nets", now(), &ranking);
        let ranked = rerank(
            vec![
                candidate("c", "c", 0.7, &[]),
                candidate("a", "a", 0.9, &[]),
                candidate("b", "b", 0.8, &[]),
            ],
            &ctx,
            SearchMode::Semantic,
            false,
        );
        assert_eq!(ids(&ranked), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_title_match_outranks_equal_similarity() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("Machine Learning", now(), &ranking);
        let ranked = rerank(
            vec![
                candidate("a", "a", 0.8, &[("title", "Cooking".into())]),
                candidate("b", "b", 0.8, &[("title", "Intro to machine learning".into())]),
            ],
            &ctx,
            SearchMode::Semantic,
            false,
        );
        assert_eq!(ids(&ranked), vec!["b", "a"]);
        assert!((ranked[0].score - 0.96).abs() < 1e-6);
    }

    #[test]
    fn test_recency_ratio_is_floor() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        let fresh = now().to_rfc3339();
        let stale = (now() - Duration::days(400)).format("%Y-%m-%d").to_string();
        let ranked = rerank(
            vec![
                candidate("old", "old", 0.8, &[("created_at", stale.into())]),
                candidate("new", "new", 0.8, &[("created_at", fresh.into())]),
            ],
            &ctx,
            SearchMode::Semantic,
            false,
        );
        assert_eq!(ids(&ranked), vec!["new", "old"]);
        assert!((ranked[0].score - 0.8).abs() < 1e-6);
        assert!((ranked[1].score / ranked[0].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_recency_multiplier_linear() {
        assert_eq!(recency_multiplier(0.0, 0.4, 365), 1.0);
        assert!((recency_multiplier(182.5, 0.4, 365) - 0.7).abs() < 1e-6);
        assert_eq!(recency_multiplier(365.0, 0.4, 365), 0.4);
        assert_eq!(recency_multiplier(5000.0, 0.4, 365), 0.4);
    }

    #[test]
    fn test_missing_or_future_date_is_not_penalised() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        let none = candidate("a", "a", 0.5, &[]);
        let future = candidate(
            "b",
            "b",
            0.5,
            &[("created_at", (now() + Duration::days(3)).to_rfc3339().into())],
        );
        assert_eq!(recency(&none, &ctx), 1.0);
        assert_eq!(recency(&future, &ctx), 1.0);
    }

    #[test]
    fn test_quality_multiplier() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        assert_eq!(quality(&candidate("a", "a", 1.0, &[]), &ctx), 1.0);
        let high = candidate("b", "b", 1.0, &[("quality_score", MetadataValue::Int(9))]);
        assert!((quality(&high, &ctx) - 1.4).abs() < 1e-6);
        let text = candidate("c", "c", 1.0, &[("quality_score", "3".into())]);
        assert!((quality(&text, &ctx) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_adjustments_applied_in_declared_order() {
        let names: Vec<_> = ADJUSTMENTS.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["title_match", "quality", "recency"]);

        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        let ranked = rerank(vec![candidate("a", "a", 0.5, &[])], &ctx, SearchMode::Semantic, false);
        let applied: Vec<_> = ranked[0].adjustments.iter().map(|a| a.name).collect();
        assert_eq!(applied, names);
    }

    #[test]
    fn test_dedup_per_source_unless_chunk_level() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        let make = || {
            vec![
                candidate("a1", "doc-a", 0.9, &[]),
                candidate("a2", "doc-a", 0.85, &[]),
                candidate("b1", "doc-b", 0.8, &[]),
            ]
        };
        assert_eq!(ids(&rerank(make(), &ctx, SearchMode::Semantic, false)), vec!["a1", "b1"]);
        assert_eq!(
            ids(&rerank(make(), &ctx, SearchMode::Semantic, true)),
            vec!["a1", "a2", "b1"]
        );
    }

    #[test]
    fn test_ties_broken_by_chunk_id() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("q", now(), &ranking);
        let ranked = rerank(
            vec![candidate("z", "z", 0.5, &[]), candidate("m", "m", 0.5, &[])],
            &ctx,
            SearchMode::Semantic,
            false,
        );
        assert_eq!(ids(&ranked), vec!["m", "z"]);
    }

    #[test]
    fn test_hybrid_blend() {
        let ranking = RankingConfig::default();
        let ctx = QueryContext::new("rust search", now(), &ranking);
        let mut a = candidate("a", "a", 0.5, &[]);
        a.record.text = "Rust makes search fast".into();
        let mut b = candidate("b", "b", 0.6, &[]);
        b.record.text = "Nothing relevant".into();

        let ranked = rerank(vec![a, b], &ctx, SearchMode::Hybrid, false);
        assert_eq!(ids(&ranked), vec!["a", "b"]);
        assert!((ranked[0].score - (0.5 * 0.7 + 1.0 * 0.3)).abs() < 1e-6);
        assert!((ranked[1].score - 0.6 * 0.7).abs() < 1e-6);
        assert_eq!(ranked[1].keyword, Some(0.0));
    }

    #[test]
    fn test_snippet_picks_best_sentence() {
        let tokens = tokenize("machine learning");
        let text = "Intro text here. Machine learning is everywhere. Learning is fun.";
        assert_eq!(extract_snippet(text, &tokens, 240), "Machine learning is everywhere");

        // Tie goes to the earliest.
        let text = "Learning first. Learning second.";
        assert_eq!(extract_snippet(text, &tokens, 240), "Learning first");
    }

    #[test]
    fn test_snippet_truncates_with_ellipsis() {
        let tokens = tokenize("alpha");
        let snippet = extract_snippet("alpha beta gamma delta", &tokens, 10);
        assert_eq!(snippet, "alpha beta...");
        assert_eq!(extract_snippet("", &tokens, 10), "");
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_date(&"2024-03-01".into()), Some(expected));
        assert_eq!(parse_date(&"2024-03-01T00:00:00Z".into()), Some(expected));
        assert_eq!(parse_date(&"2024-03-01 00:00:00".into()), Some(expected));
        assert_eq!(parse_date(&MetadataValue::Int(expected.timestamp())), Some(expected));
        assert_eq!(parse_date(&"soon".into()), None);
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("Hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
