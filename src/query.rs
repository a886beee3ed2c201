//! Query DSL for the search store: boolean filter trees and nested terms
//! aggregations, serialized to the store's native JSON request format.

use serde_json::{json, Value};

/// A filter expression. Composes with [`Filter::and`] / [`Filter::or`] and
/// serializes into the store's boolean query JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Range over a field; only the set bounds are emitted.
    Range {
        field: String,
        gte: Option<Value>,
        lt: Option<Value>,
        lte: Option<Value>,
    },
    /// Exact match on a keyword field.
    Term { field: String, value: String },
    /// Wildcard match on a keyword field.
    Wildcard { field: String, value: String },
    /// Analyzed full-text match.
    Match { field: String, value: String },
    /// Set membership by document ID.
    Ids(Vec<String>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Datetime range `gte <= field < lt`. Bounds are store-native date
    /// expressions, absolute or relative (e.g. "now-7d").
    pub fn date_range(field: &str, gte: &str, lt: &str) -> Filter {
        Filter::Range {
            field: field.to_string(),
            gte: Some(json!(gte)),
            lt: Some(json!(lt)),
            lte: None,
        }
    }

    /// Numeric `field >= value`.
    pub fn gte(field: &str, value: impl Into<Value>) -> Filter {
        Filter::Range {
            field: field.to_string(),
            gte: Some(value.into()),
            lt: None,
            lte: None,
        }
    }

    /// Numeric `gte <= field <= lte`.
    pub fn between(field: &str, gte: impl Into<Value>, lte: impl Into<Value>) -> Filter {
        Filter::Range {
            field: field.to_string(),
            gte: Some(gte.into()),
            lt: None,
            lte: Some(lte.into()),
        }
    }

    pub fn term(field: &str, value: &str) -> Filter {
        Filter::Term {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn wildcard(field: &str, value: &str) -> Filter {
        Filter::Wildcard {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    /// Term match, or a wildcard match when the value embeds a `*`. Callers
    /// signal wildcard intent implicitly through the value itself.
    pub fn term_or_wildcard(field: &str, value: &str) -> Filter {
        if value.contains('*') {
            Filter::wildcard(field, value)
        } else {
            Filter::term(field, value)
        }
    }

    pub fn match_field(field: &str, value: &str) -> Filter {
        Filter::Match {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Filter {
        Filter::Ids(values.into_iter().map(Into::into).collect())
    }

    /// Conjunction; flattens nested `And`s.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), b) => {
                a.push(b);
                Filter::And(a)
            }
            (a, Filter::And(mut b)) => {
                b.insert(0, a);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Disjunction; flattens nested `Or`s.
    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::Or(mut a), Filter::Or(b)) => {
                a.extend(b);
                Filter::Or(a)
            }
            (Filter::Or(mut a), b) => {
                a.push(b);
                Filter::Or(a)
            }
            (a, Filter::Or(mut b)) => {
                b.insert(0, a);
                Filter::Or(b)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Filter::Range { field, gte, lt, lte } => {
                let mut bounds = serde_json::Map::new();
                if let Some(v) = gte {
                    bounds.insert("gte".to_string(), v.clone());
                }
                if let Some(v) = lt {
                    bounds.insert("lt".to_string(), v.clone());
                }
                if let Some(v) = lte {
                    bounds.insert("lte".to_string(), v.clone());
                }
                json!({ "range": { field: bounds } })
            }
            Filter::Term { field, value } => json!({ "term": { field: value } }),
            Filter::Wildcard { field, value } => json!({ "wildcard": { field: value } }),
            Filter::Match { field, value } => json!({ "match": { field: value } }),
            Filter::Ids(values) => json!({ "ids": { "values": values } }),
            Filter::And(filters) => {
                let clauses: Vec<Value> = filters.iter().map(Filter::to_json).collect();
                json!({ "bool": { "must": clauses } })
            }
            Filter::Or(filters) => {
                let clauses: Vec<Value> = filters.iter().map(Filter::to_json).collect();
                json!({ "bool": { "should": clauses, "minimum_should_match": 1 } })
            }
        }
    }
}

/// A named sum metric attached to the innermost bucket level.
#[derive(Debug, Clone, PartialEq)]
pub struct SumMetric {
    pub name: String,
    pub field: String,
}

/// A terms ("group by") bucket aggregation, nestable to arbitrary depth,
/// with optional sum metrics on its buckets.
///
/// The per-level bucket count is capped at `size`; when a level has more
/// distinct values than that, the result silently truncates. That is an
/// accepted approximation, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub name: String,
    pub field: String,
    pub size: usize,
    pub metrics: Vec<SumMetric>,
    pub sub: Option<Box<Aggregation>>,
}

impl Aggregation {
    pub fn terms(name: &str, field: &str, size: usize) -> Aggregation {
        Aggregation {
            name: name.to_string(),
            field: field.to_string(),
            size,
            metrics: Vec::new(),
            sub: None,
        }
    }

    /// Attach a sum metric computed per bucket.
    pub fn metric(mut self, name: &str, field: &str) -> Aggregation {
        self.metrics.push(SumMetric {
            name: name.to_string(),
            field: field.to_string(),
        });
        self
    }

    /// Nest a sub-aggregation inside each bucket of this one.
    pub fn bucket(mut self, sub: Aggregation) -> Aggregation {
        self.sub = Some(Box::new(sub));
        self
    }

    /// Serialize to the `{name: {terms: ..., aggs: ...}}` request mapping.
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(
            "terms".to_string(),
            json!({ "field": self.field, "size": self.size }),
        );

        let mut aggs = serde_json::Map::new();
        for metric in &self.metrics {
            aggs.insert(
                metric.name.clone(),
                json!({ "sum": { "field": metric.field } }),
            );
        }
        if let Some(sub) = &self.sub {
            if let Value::Object(sub_map) = sub.to_json() {
                aggs.extend(sub_map);
            }
        }
        if !aggs.is_empty() {
            body.insert("aggs".to_string(), Value::Object(aggs));
        }

        json!({ &self.name: Value::Object(body) })
    }
}
