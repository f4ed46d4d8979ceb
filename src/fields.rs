//! Field-expression parsing and record projection.
//!
//! A field expression is a comma-separated list of dot-paths in Upstream's
//! grammar (`title,authors.name,citations.year`). The projector restricts a
//! full Upstream-shaped JSON document to the requested subtree. It is a pure
//! function over the document: it never fetches, and projecting an already
//! projected record with the same expression is a no-op.
//!
//! Projection rules:
//! - an empty expression means the default projection (`paperId`, `title`);
//! - `paperId` is always included in a paper projection;
//! - missing source fields yield absent output keys, not nulls;
//! - array fields are projected elementwise, and element-identity keys
//!   (`paperId`, `authorId`) are always retained.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Keys that identify an element inside an array and are always retained.
const IDENTITY_KEYS: [&str; 2] = ["paperId", "authorId"];

/// Relation-item attributes that live on the edge rather than the
/// neighbor paper (Upstream's citation/reference item shape).
const EDGE_ATTRS: [&str; 3] = ["contexts", "intents", "isInfluential"];

/// Errors produced while parsing a field expression.
#[derive(Debug, Error)]
pub enum FieldExprError {
    /// A path segment is empty or contains characters outside the grammar
    #[error("invalid field path: {0:?}")]
    InvalidPath(String),
}

/// A parsed field expression: a tree of requested paths.
///
/// Leaves (nodes with no children) select the whole subtree at that path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldExpr {
    root: PathNode,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PathNode {
    children: BTreeMap<String, PathNode>,
}

impl PathNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn insert(&mut self, segments: &[&str]) {
        if let Some((first, rest)) = segments.split_first() {
            let child = self.children.entry((*first).to_string()).or_default();
            child.insert(rest);
        }
    }
}

impl FieldExpr {
    /// Parse a comma-separated field expression.
    ///
    /// Each path is a dot-separated sequence of names; names are ASCII
    /// alphanumerics plus `_`. An empty or whitespace-only expression
    /// parses to the default projection.
    ///
    /// # Errors
    /// Returns `FieldExprError::InvalidPath` on empty segments or
    /// out-of-grammar characters.
    pub fn parse(expr: &str) -> Result<Self, FieldExprError> {
        let mut root = PathNode::default();
        let mut any = false;

        for raw_path in expr.split(',') {
            let path = raw_path.trim();
            if path.is_empty() {
                continue;
            }
            any = true;

            let segments: Vec<&str> = path.split('.').collect();
            for segment in &segments {
                if segment.is_empty()
                    || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(FieldExprError::InvalidPath(path.to_string()));
                }
            }
            root.insert(&segments);
        }

        if !any {
            return Ok(Self::default_paper());
        }
        Ok(Self { root })
    }

    /// Parse an optional expression; `None` yields the default projection.
    pub fn parse_opt(expr: Option<&str>) -> Result<Self, FieldExprError> {
        match expr {
            Some(s) => Self::parse(s),
            None => Ok(Self::default_paper()),
        }
    }

    /// The default paper projection: `paperId`, `title`.
    pub fn default_paper() -> Self {
        let mut root = PathNode::default();
        root.insert(&["paperId"]);
        root.insert(&["title"]);
        Self { root }
    }

    /// Top-level field names requested by this expression.
    pub fn top_level(&self) -> impl Iterator<Item = &str> {
        self.root.children.keys().map(String::as_str)
    }

    /// Project a paper document to this expression.
    ///
    /// `paperId` is always included in the output when the source carries
    /// one. Unknown requested fields are silently absent from the output.
    pub fn project_paper(&self, data: &Value) -> Value {
        let mut projected = match project_node(data, &self.root) {
            Some(Value::Object(map)) => map,
            Some(other) => return other,
            None => Map::new(),
        };

        if !projected.contains_key("paperId") {
            if let Some(id) = data.get("paperId") {
                projected.insert("paperId".to_string(), id.clone());
            }
        }
        Value::Object(projected)
    }

    /// Project a relation item (citation or reference entry).
    ///
    /// Edge attributes (`contexts`, `intents`, `isInfluential`) are taken
    /// from the item itself when requested; every other path projects the
    /// neighbor paper nested under `neighbor_key` (`citingPaper` /
    /// `citedPaper`), whose `paperId` is always retained.
    pub fn project_relation_item(&self, item: &Value, neighbor_key: &str) -> Value {
        let mut out = Map::new();

        for attr in EDGE_ATTRS {
            if self.root.children.contains_key(attr) {
                if let Some(v) = item.get(attr) {
                    out.insert(attr.to_string(), v.clone());
                }
            }
        }

        if let Some(neighbor) = item.get(neighbor_key) {
            let mut paper_expr = self.clone();
            for attr in EDGE_ATTRS {
                paper_expr.root.children.remove(attr);
            }
            out.insert(
                neighbor_key.to_string(),
                paper_expr.project_paper(neighbor),
            );
        }
        Value::Object(out)
    }
}

/// Recursive projection of one value against one path node.
///
/// Returns `None` when the requested path cannot exist at this value
/// (e.g. subfields requested of a scalar), which the caller renders as an
/// absent key.
fn project_node(value: &Value, node: &PathNode) -> Option<Value> {
    if node.is_leaf() {
        return Some(value.clone());
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for key in IDENTITY_KEYS {
                if !node.children.contains_key(key) {
                    if let Some(id) = map.get(key) {
                        out.insert(key.to_string(), id.clone());
                    }
                }
            }
            for (name, child) in &node.children {
                if let Some(source) = map.get(name) {
                    if let Some(projected) = project_node(source, child) {
                        out.insert(name.clone(), projected);
                    }
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| project_node(item, node))
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paper() -> Value {
        json!({
            "paperId": "649def34f8be52c8b66281af98ae884c09aef38b",
            "title": "Construction of the Literature Graph in Semantic Scholar",
            "year": 2018,
            "venue": "NAACL",
            "authors": [
                {"authorId": "1741101", "name": "W. Ammar", "hIndex": 30},
                {"authorId": "46258841", "name": "Dirk Groeneveld", "hIndex": 12}
            ],
            "externalIds": {"DOI": "10.18653/v1/N18-3011", "ArXiv": "1805.02262"}
        })
    }

    #[test]
    fn test_parse_rejects_bad_segments() {
        assert!(FieldExpr::parse("title,,year").is_ok()); // empty path skipped
        assert!(FieldExpr::parse("authors..name").is_err());
        assert!(FieldExpr::parse("title;drop").is_err());
        assert!(FieldExpr::parse("авторы").is_err());
    }

    #[test]
    fn test_empty_expression_is_default() {
        let expr = FieldExpr::parse("").unwrap();
        assert_eq!(expr, FieldExpr::default_paper());

        let out = expr.project_paper(&paper());
        assert_eq!(
            out,
            json!({
                "paperId": "649def34f8be52c8b66281af98ae884c09aef38b",
                "title": "Construction of the Literature Graph in Semantic Scholar"
            })
        );
    }

    #[test]
    fn test_paper_id_always_included() {
        let expr = FieldExpr::parse("year").unwrap();
        let out = expr.project_paper(&paper());
        assert_eq!(out["paperId"], paper()["paperId"]);
        assert_eq!(out["year"], json!(2018));
        assert!(out.get("title").is_none());
    }

    #[test]
    fn test_missing_fields_absent_not_null() {
        let expr = FieldExpr::parse("abstract,year").unwrap();
        let out = expr.project_paper(&paper());
        assert!(out.get("abstract").is_none());
        assert_eq!(out["year"], json!(2018));
    }

    #[test]
    fn test_array_subfields_project_elementwise_with_identity() {
        let expr = FieldExpr::parse("authors.name").unwrap();
        let out = expr.project_paper(&paper());
        assert_eq!(
            out["authors"],
            json!([
                {"authorId": "1741101", "name": "W. Ammar"},
                {"authorId": "46258841", "name": "Dirk Groeneveld"}
            ])
        );
    }

    #[test]
    fn test_leaf_selects_whole_subtree() {
        let expr = FieldExpr::parse("externalIds").unwrap();
        let out = expr.project_paper(&paper());
        assert_eq!(out["externalIds"], paper()["externalIds"]);
    }

    #[test]
    fn test_subfield_of_scalar_is_absent() {
        let expr = FieldExpr::parse("year.month").unwrap();
        let out = expr.project_paper(&paper());
        assert!(out.get("year").is_none());
    }

    #[test]
    fn test_projection_idempotent() {
        for raw in ["title,authors.name", "year,externalIds", "authors"] {
            let expr = FieldExpr::parse(raw).unwrap();
            let once = expr.project_paper(&paper());
            let twice = expr.project_paper(&once);
            assert_eq!(once, twice, "projection not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_relation_item_projection() {
        let item = json!({
            "contexts": ["as shown in [12]"],
            "intents": ["methodology"],
            "isInfluential": false,
            "citingPaper": {
                "paperId": "b1".repeat(20),
                "title": "A Citing Paper",
                "year": 2020
            }
        });

        let expr = FieldExpr::parse("contexts,title").unwrap();
        let out = expr.project_relation_item(&item, "citingPaper");
        assert_eq!(out["contexts"], json!(["as shown in [12]"]));
        assert!(out.get("intents").is_none());
        assert_eq!(out["citingPaper"]["title"], json!("A Citing Paper"));
        assert_eq!(out["citingPaper"]["paperId"], json!("b1".repeat(20)));
        assert!(out["citingPaper"].get("year").is_none());
    }
}
