//! External-identifier alias handling.
//!
//! The same paper is addressable by many distinct external IDs (DOI, ArXiv,
//! CorpusId, ...). This module owns the rules that collapse them onto one
//! canonical identity: reference parsing, kind-specific normalization, and
//! the durable `AliasIndex` mapping `(kind, normalized_value)` to a
//! canonical paper id.
//!
//! Normalization is stable and deterministic: the same raw input always
//! yields the same normalized key, so the index can enforce uniqueness on
//! `(kind, normalized_value)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::models::PaperRecord;

pub mod sqlite;

/// Errors from reference parsing, normalization, and index access.
#[derive(Debug, Error)]
pub enum AliasError {
    /// The raw reference is not a canonical id and carries no recognized prefix
    #[error("unrecognized paper reference: {0:?}")]
    InvalidRef(String),

    /// The value cannot be normalized for its kind (e.g. non-numeric CorpusId)
    #[error("invalid {kind} value: {value:?}")]
    InvalidValue { kind: AliasKind, value: String },

    /// Underlying database failure
    #[error("alias database error: {0}")]
    Database(String),
}

/// Result type for alias operations.
pub type AliasResult<T> = Result<T, AliasError>;

/// The kinds of external identifier the proxy resolves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AliasKind {
    Doi,
    Arxiv,
    CorpusId,
    Mag,
    Acl,
    Pmid,
    Pmcid,
    Dblp,
    Url,
    TitleNorm,
}

impl AliasKind {
    /// Stable storage name for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasKind::Doi => "DOI",
            AliasKind::Arxiv => "ARXIV",
            AliasKind::CorpusId => "CORPUS_ID",
            AliasKind::Mag => "MAG",
            AliasKind::Acl => "ACL",
            AliasKind::Pmid => "PMID",
            AliasKind::Pmcid => "PMCID",
            AliasKind::Dblp => "DBLP",
            AliasKind::Url => "URL",
            AliasKind::TitleNorm => "TITLE_NORM",
        }
    }

    /// Parse a storage name back to a kind.
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "DOI" => Some(AliasKind::Doi),
            "ARXIV" => Some(AliasKind::Arxiv),
            "CORPUS_ID" => Some(AliasKind::CorpusId),
            "MAG" => Some(AliasKind::Mag),
            "ACL" => Some(AliasKind::Acl),
            "PMID" => Some(AliasKind::Pmid),
            "PMCID" => Some(AliasKind::Pmcid),
            "DBLP" => Some(AliasKind::Dblp),
            "URL" => Some(AliasKind::Url),
            "TITLE_NORM" => Some(AliasKind::TitleNorm),
            _ => None,
        }
    }

    /// Map an inbound reference prefix (case-insensitive) to a kind.
    ///
    /// `TITLE_NORM` has no inbound prefix: title lookups arrive only through
    /// the title-match search path.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_uppercase().as_str() {
            "DOI" => Some(AliasKind::Doi),
            "ARXIV" => Some(AliasKind::Arxiv),
            "CORPUS_ID" | "CORPUSID" | "CORPUS" => Some(AliasKind::CorpusId),
            "MAG" => Some(AliasKind::Mag),
            "ACL" => Some(AliasKind::Acl),
            "PMID" => Some(AliasKind::Pmid),
            "PMCID" => Some(AliasKind::Pmcid),
            "DBLP" => Some(AliasKind::Dblp),
            "URL" => Some(AliasKind::Url),
            _ => None,
        }
    }

    /// Map an `externalIds` key from an Upstream document to a kind.
    pub fn from_upstream_key(key: &str) -> Option<Self> {
        match key {
            "DOI" => Some(AliasKind::Doi),
            "ArXiv" => Some(AliasKind::Arxiv),
            "CorpusId" => Some(AliasKind::CorpusId),
            "MAG" => Some(AliasKind::Mag),
            "ACL" => Some(AliasKind::Acl),
            "PubMed" => Some(AliasKind::Pmid),
            "PubMedCentral" => Some(AliasKind::Pmcid),
            "DBLP" => Some(AliasKind::Dblp),
            "URL" => Some(AliasKind::Url),
            _ => None,
        }
    }

    /// Prefix used when forwarding this kind to Upstream as a paper ref.
    pub fn upstream_prefix(&self) -> &'static str {
        match self {
            AliasKind::Doi => "DOI",
            AliasKind::Arxiv => "ARXIV",
            AliasKind::CorpusId => "CorpusId",
            AliasKind::Mag => "MAG",
            AliasKind::Acl => "ACL",
            AliasKind::Pmid => "PMID",
            AliasKind::Pmcid => "PMCID",
            AliasKind::Dblp => "DBLP",
            AliasKind::Url => "URL",
            AliasKind::TitleNorm => "TITLE_NORM",
        }
    }
}

impl std::fmt::Display for AliasKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed inbound paper reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperRef {
    /// Canonical 40-hex paper id; bypasses the alias index
    Canonical(String),

    /// External identifier, already normalized for its kind
    Alias { kind: AliasKind, value: String },
}

impl PaperRef {
    /// Reference string to send Upstream for this ref.
    pub fn to_upstream_ref(&self) -> String {
        match self {
            PaperRef::Canonical(id) => id.clone(),
            PaperRef::Alias { kind, value } => format!("{}:{}", kind.upstream_prefix(), value),
        }
    }
}

/// True iff the token is a canonical paper id (40 hex characters).
pub fn is_canonical_id(token: &str) -> bool {
    token.len() == 40 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a raw inbound reference.
///
/// Accepts a bare 40-hex canonical id, or a `PREFIX:value` form with a
/// recognized prefix. Anything else is an `InvalidRef`, surfaced to the
/// caller as a bad request.
pub fn parse_paper_ref(raw: &str) -> AliasResult<PaperRef> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AliasError::InvalidRef(raw.to_string()));
    }

    if is_canonical_id(raw) {
        return Ok(PaperRef::Canonical(raw.to_ascii_lowercase()));
    }

    let (prefix, value) = raw
        .split_once(':')
        .ok_or_else(|| AliasError::InvalidRef(raw.to_string()))?;
    let kind =
        AliasKind::from_prefix(prefix).ok_or_else(|| AliasError::InvalidRef(raw.to_string()))?;
    let value = normalize(kind, value)?;
    Ok(PaperRef::Alias { kind, value })
}

/// Normalize a raw alias value for its kind.
///
/// Rules are stable and deterministic; see the per-kind helpers.
pub fn normalize(kind: AliasKind, raw: &str) -> AliasResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AliasError::InvalidValue {
            kind,
            value: raw.to_string(),
        });
    }

    let value = match kind {
        AliasKind::Doi => normalize_doi(trimmed),
        AliasKind::Arxiv => normalize_arxiv(trimmed),
        AliasKind::CorpusId => {
            let n: u64 = trimmed.parse().map_err(|_| AliasError::InvalidValue {
                kind,
                value: raw.to_string(),
            })?;
            n.to_string()
        }
        AliasKind::Mag | AliasKind::Pmid => trimmed.to_string(),
        AliasKind::Acl | AliasKind::Pmcid => trimmed.to_ascii_uppercase(),
        AliasKind::Dblp => trimmed.to_string(),
        AliasKind::Url => normalize_url(trimmed),
        AliasKind::TitleNorm => normalize_title(trimmed),
    };

    if value.is_empty() {
        return Err(AliasError::InvalidValue {
            kind,
            value: raw.to_string(),
        });
    }
    Ok(value)
}

/// Lowercase, strip all whitespace, strip an embedded `doi:` scheme.
fn normalize_doi(raw: &str) -> String {
    let mut doi: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if let Some(rest) = doi.strip_prefix("doi:") {
        doi = rest.to_string();
    }
    doi
}

/// Strip an `arxiv:` scheme and a trailing version suffix (`vN`).
///
/// Keeps both modern (`2106.15928`) and archive (`hep-th/9901001`) forms.
fn normalize_arxiv(raw: &str) -> String {
    let mut id = raw.trim().to_lowercase();
    if let Some(rest) = id.strip_prefix("arxiv:") {
        id = rest.to_string();
    }

    // trailing vN version marker
    if let Some(pos) = id.rfind('v') {
        let (head, tail) = id.split_at(pos);
        if !head.is_empty()
            && tail.len() > 1
            && tail[1..].chars().all(|c| c.is_ascii_digit())
        {
            id = head.to_string();
        }
    }
    id
}

/// Lowercase the host, strip a trailing slash, drop `utm_*` tracking params.
fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.trim_end_matches('/').to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    // Url lowercases the host on parse; only the trailing slash is left.
    parsed.to_string().trim_end_matches('/').to_string()
}

/// Lowercase, NFKC-normalize, strip punctuation and all whitespace.
///
/// The result is intentionally aggressive: title aliases are best-effort
/// and collisions across unrelated papers are tolerated (first mapping
/// wins, later ones surface as conflicts).
pub fn normalize_title(raw: &str) -> String {
    raw.nfkc()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// A recording attempt that found the key already pointing elsewhere.
///
/// Conflicts are reported, never applied: the original mapping is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasConflict {
    pub kind: AliasKind,
    pub value: String,
    pub existing_paper_id: String,
    pub attempted_paper_id: String,
}

/// Aggregate statistics over the alias index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasStats {
    pub total_mappings: u64,
    pub distinct_papers: u64,
    pub per_kind: Vec<(String, u64)>,
}

/// Durable mapping `(kind, normalized_value) -> canonical paper id`.
///
/// `(kind, normalized_value)` is unique; many aliases may point at one
/// paper, and for a given paper at most one value is kept per kind.
#[async_trait]
pub trait AliasIndex: Send + Sync {
    /// Look up the canonical id for a normalized alias.
    async fn resolve(&self, kind: AliasKind, value: &str) -> AliasResult<Option<String>>;

    /// Record aliases for a paper.
    ///
    /// Existing identical mappings are refreshed; keys already pointing at a
    /// *different* paper are left untouched and returned as conflicts.
    async fn record(
        &self,
        paper_id: &str,
        aliases: &[(AliasKind, String)],
    ) -> AliasResult<Vec<AliasConflict>>;

    /// All aliases currently recorded for a paper.
    async fn aliases_of(&self, paper_id: &str) -> AliasResult<Vec<(AliasKind, String)>>;

    /// Aggregate statistics for operator tooling.
    async fn statistics(&self) -> AliasResult<AliasStats>;

    /// Delete mappings not touched for `days` days; returns the count.
    async fn cleanup_older_than(&self, days: u32) -> AliasResult<u64>;
}

/// Harvest recordable aliases from a fetched paper document.
///
/// Pulls every recognized `externalIds` entry plus a normalized-title
/// alias. Values that fail normalization are skipped.
pub fn aliases_from_record(record: &PaperRecord) -> Vec<(AliasKind, String)> {
    let mut out = Vec::new();

    if let Some(ids) = record.external_ids() {
        for (key, value) in ids {
            let Some(kind) = AliasKind::from_upstream_key(key) else {
                continue;
            };
            let raw = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if let Ok(normalized) = normalize(kind, &raw) {
                out.push((kind, normalized));
            }
        }
    }

    if let Some(title) = record.title() {
        let norm = normalize_title(title);
        if !norm.is_empty() {
            out.push((AliasKind::TitleNorm, norm));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_id_passthrough() {
        let id = "649def34f8be52c8b66281af98ae884c09aef38b";
        assert_eq!(
            parse_paper_ref(id).unwrap(),
            PaperRef::Canonical(id.to_string())
        );
        // hex case is folded
        assert_eq!(
            parse_paper_ref(&id.to_ascii_uppercase()).unwrap(),
            PaperRef::Canonical(id.to_string())
        );
    }

    #[test]
    fn test_unprefixed_non_hex_rejected() {
        assert!(matches!(
            parse_paper_ref("not-a-paper"),
            Err(AliasError::InvalidRef(_))
        ));
        // 39 hex chars is not canonical
        assert!(parse_paper_ref(&"a".repeat(39)).is_err());
        assert!(parse_paper_ref("").is_err());
    }

    #[test]
    fn test_prefixed_refs_parse_and_normalize() {
        assert_eq!(
            parse_paper_ref("DOI:10.18653/v1/N18-3011").unwrap(),
            PaperRef::Alias {
                kind: AliasKind::Doi,
                value: "10.18653/v1/n18-3011".to_string()
            }
        );
        assert_eq!(
            parse_paper_ref("arxiv:2106.15928v2").unwrap(),
            PaperRef::Alias {
                kind: AliasKind::Arxiv,
                value: "2106.15928".to_string()
            }
        );
        assert_eq!(
            parse_paper_ref("CORPUSID:00215046").unwrap(),
            PaperRef::Alias {
                kind: AliasKind::CorpusId,
                value: "215046".to_string()
            }
        );
        assert!(parse_paper_ref("FOO:bar").is_err());
    }

    #[test]
    fn test_doi_normalization() {
        assert_eq!(normalize_doi("doi:10.1038/NATURE14539"), "10.1038/nature14539");
        assert_eq!(normalize_doi(" 10.1038/nature14539 "), "10.1038/nature14539");
    }

    #[test]
    fn test_arxiv_normalization() {
        assert_eq!(normalize_arxiv("2106.15928v2"), "2106.15928");
        assert_eq!(normalize_arxiv("arXiv:2106.15928"), "2106.15928");
        assert_eq!(normalize_arxiv("hep-th/9901001v3"), "hep-th/9901001");
        // 'v' not followed by digits only is kept
        assert_eq!(normalize_arxiv("cond-mat/051vx"), "cond-mat/051vx");
    }

    #[test]
    fn test_corpus_id_rejects_non_numeric() {
        assert!(normalize(AliasKind::CorpusId, "12x4").is_err());
        assert_eq!(normalize(AliasKind::CorpusId, " 0042 ").unwrap(), "42");
    }

    #[test]
    fn test_url_normalization() {
        assert_eq!(
            normalize(AliasKind::Url, "https://EXAMPLE.org/Paper/1/").unwrap(),
            "https://example.org/Paper/1"
        );
        assert_eq!(
            normalize(
                AliasKind::Url,
                "https://example.org/p?utm_source=x&id=7&utm_campaign=y"
            )
            .unwrap(),
            "https://example.org/p?id=7"
        );
    }

    #[test]
    fn test_title_normalization_nfkc() {
        assert_eq!(
            normalize_title("Attention Is All You Need!"),
            "attentionisallyouneed"
        );
        // ﬁ ligature decomposes to "fi" under NFKC
        assert_eq!(normalize_title("Eﬃcient \u{FB01}nding"), "efficientfinding");
        assert_eq!(normalize_title("  --  "), "");
    }

    #[test]
    fn test_aliases_from_record_harvests_external_ids_and_title() {
        let record = PaperRecord::from_upstream(
            "a".repeat(40),
            json!({
                "title": "A Title",
                "externalIds": {
                    "DOI": "10.1/X",
                    "ArXiv": "2106.15928",
                    "CorpusId": 215046,
                    "PubMed": "19872477",
                    "SomethingElse": "ignored"
                }
            }),
        );

        let mut aliases = aliases_from_record(&record);
        aliases.sort();
        assert!(aliases.contains(&(AliasKind::Doi, "10.1/x".to_string())));
        assert!(aliases.contains(&(AliasKind::Arxiv, "2106.15928".to_string())));
        assert!(aliases.contains(&(AliasKind::CorpusId, "215046".to_string())));
        assert!(aliases.contains(&(AliasKind::Pmid, "19872477".to_string())));
        assert!(aliases.contains(&(AliasKind::TitleNorm, "atitle".to_string())));
        assert_eq!(aliases.len(), 5);
    }

    #[test]
    fn test_upstream_ref_roundtrip() {
        let r = parse_paper_ref("DOI:10.18653/v1/N18-3011").unwrap();
        assert_eq!(r.to_upstream_ref(), "DOI:10.18653/v1/n18-3011");

        let r = parse_paper_ref("CORPUS_ID:215046").unwrap();
        assert_eq!(r.to_upstream_ref(), "CorpusId:215046");
    }
}
