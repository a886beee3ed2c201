//! The abstract queryable store and its HTTP search-engine implementation.
//!
//! The analysis engine only ever talks to a [`SearchStore`]: a filtered
//! search returning either projected documents or, when an aggregation is
//! attached, a tree of terms buckets with per-bucket sum metrics. Tests
//! substitute an in-memory implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{FlakrsError, Result};
use crate::query::{Aggregation, Filter};

/// One search round-trip: a filter, a source projection, a result size and
/// an optional aggregation.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub filter: Filter,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub size: usize,
    pub agg: Option<Aggregation>,
}

impl SearchRequest {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            includes: Vec::new(),
            excludes: Vec::new(),
            size: 1,
            agg: None,
        }
    }

    pub fn source(mut self, includes: &[&str], excludes: &[&str]) -> Self {
        self.includes = includes.iter().map(|s| s.to_string()).collect();
        self.excludes = excludes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn aggregate(mut self, agg: Aggregation) -> Self {
        self.agg = Some(agg);
        self
    }

    /// Serialize to the store's request body JSON.
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(
            "query".to_string(),
            json!({ "bool": { "filter": [self.filter.to_json()] } }),
        );
        body.insert(
            "_source".to_string(),
            json!({ "includes": self.includes, "excludes": self.excludes }),
        );
        body.insert("size".to_string(), json!(self.size));
        if let Some(agg) = &self.agg {
            body.insert("aggs".to_string(), agg.to_json());
        }
        Value::Object(body)
    }
}

/// One matching document: store-assigned ID plus the projected source.
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// One terms bucket. `sums` holds the metric values attached at this level,
/// `sub` the buckets of the nested sub-aggregation (empty at the deepest
/// level).
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    pub key: String,
    pub doc_count: u64,
    pub sums: BTreeMap<String, f64>,
    pub sub: Vec<Bucket>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    pub buckets: Vec<Bucket>,
}

/// Abstract search backend. Implementations must tolerate concurrent
/// outstanding queries; the flaky engine fans out phase-2 lookups across
/// a worker pool sharing one store reference.
pub trait SearchStore: Sync {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`SearchStore`] against a search-engine endpoint.
pub struct EsStore {
    agent: ureq::Agent,
    base_url: String,
    index: String,
}

impl EsStore {
    pub fn new(base_url: &str, index: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(DEFAULT_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        }
    }
}

impl SearchStore for EsStore {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let url = format!("{}/{}/_search", self.base_url, self.index);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(request.to_json());

        let raw: Value = match response {
            Ok(resp) => resp.into_json()?,
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(FlakrsError::Store(format!(
                    "search failed (HTTP {}): {}",
                    code, body
                )));
            }
            Err(e) => return Err(FlakrsError::Store(e.to_string())),
        };

        decode_response(request, &raw)
    }
}

/// Decode a raw response body into hits and, when the request carried an
/// aggregation, the bucket tree. Bucket decoding is driven by the request's
/// aggregation shape so nested levels resolve by name.
pub fn decode_response(request: &SearchRequest, raw: &Value) -> Result<SearchResponse> {
    let mut response = SearchResponse::default();

    if let Some(hits) = raw["hits"]["hits"].as_array() {
        for hit in hits {
            let id = hit["_id"]
                .as_str()
                .ok_or_else(|| FlakrsError::Store("hit without _id".to_string()))?
                .to_string();
            response.hits.push(Hit {
                id,
                source: hit["_source"].clone(),
            });
        }
    }

    if let Some(agg) = &request.agg {
        let aggregations = &raw["aggregations"];
        if !aggregations.is_null() {
            response.buckets = decode_buckets(agg, aggregations)?;
        }
    }

    Ok(response)
}

fn decode_buckets(agg: &Aggregation, parent: &Value) -> Result<Vec<Bucket>> {
    let raw_buckets = parent[&agg.name]["buckets"].as_array().ok_or_else(|| {
        FlakrsError::Store(format!("missing buckets for aggregation '{}'", agg.name))
    })?;

    let mut buckets = Vec::with_capacity(raw_buckets.len());
    for raw in raw_buckets {
        let key = match &raw["key"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut bucket = Bucket {
            key,
            doc_count: raw["doc_count"].as_u64().unwrap_or(0),
            ..Default::default()
        };
        for metric in &agg.metrics {
            let value = raw[&metric.name]["value"].as_f64().unwrap_or(0.0);
            bucket.sums.insert(metric.name.clone(), value);
        }
        if let Some(sub) = &agg.sub {
            bucket.sub = decode_buckets(sub, raw)?;
        }
        buckets.push(bucket);
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let request = SearchRequest::new(Filter::term("br_job_name.raw", "job1"))
            .source(&["br_build_id_key"], &["lhi*"])
            .size(500);
        let body = request.to_json();
        assert_eq!(
            body["query"]["bool"]["filter"][0],
            json!({ "term": { "br_job_name.raw": "job1" } })
        );
        assert_eq!(body["_source"]["includes"][0], "br_build_id_key");
        assert_eq!(body["_source"]["excludes"][0], "lhi*");
        assert_eq!(body["size"], 500);
        assert!(body.get("aggs").is_none());
    }

    #[test]
    fn test_decode_hits() {
        let request = SearchRequest::new(Filter::ids(["a"]));
        let raw = json!({
            "hits": { "hits": [
                { "_id": "a", "_source": { "br_job_name": "job1" } },
                { "_id": "b", "_source": { "br_job_name": "job2" } }
            ]}
        });
        let response = decode_response(&request, &raw).unwrap();
        assert_eq!(response.hits.len(), 2);
        assert_eq!(response.hits[0].id, "a");
        assert_eq!(response.hits[1].source["br_job_name"], "job2");
    }

    #[test]
    fn test_decode_nested_buckets_with_metrics() {
        let agg = Aggregation::terms("build_ids", "br_build_id_key", 10_000).bucket(
            Aggregation::terms("ids", "_id", 10_000)
                .metric("num_failed_tests", "f")
                .metric("num_passed_tests", "p"),
        );
        let request = SearchRequest::new(Filter::ids(["x"])).size(0).aggregate(agg);
        let raw = json!({
            "aggregations": {
                "build_ids": { "buckets": [
                    {
                        "key": "build-7",
                        "doc_count": 2,
                        "ids": { "buckets": [
                            {
                                "key": "id1",
                                "doc_count": 1,
                                "num_failed_tests": { "value": 3.0 },
                                "num_passed_tests": { "value": 10.0 }
                            },
                            {
                                "key": "id2",
                                "doc_count": 1,
                                "num_failed_tests": { "value": 0.0 },
                                "num_passed_tests": { "value": 13.0 }
                            }
                        ]}
                    }
                ]}
            }
        });
        let response = decode_response(&request, &raw).unwrap();
        assert_eq!(response.buckets.len(), 1);
        let build = &response.buckets[0];
        assert_eq!(build.key, "build-7");
        assert_eq!(build.sub.len(), 2);
        assert_eq!(build.sub[0].sums["num_failed_tests"], 3.0);
        assert_eq!(build.sub[1].sums["num_passed_tests"], 13.0);
    }

    #[test]
    fn test_decode_missing_aggregation_is_error() {
        let agg = Aggregation::terms("ids", "_id", 10);
        let request = SearchRequest::new(Filter::ids(["x"])).aggregate(agg);
        let raw = json!({ "aggregations": { "other": {} } });
        assert!(matches!(
            decode_response(&request, &raw),
            Err(FlakrsError::Store(_))
        ));
    }

    #[test]
    fn test_numeric_bucket_keys_stringify() {
        let agg = Aggregation::terms("ids", "_id", 10);
        let request = SearchRequest::new(Filter::ids(["x"])).aggregate(agg);
        let raw = json!({
            "aggregations": { "ids": { "buckets": [ { "key": 42, "doc_count": 1 } ] } }
        });
        let response = decode_response(&request, &raw).unwrap();
        assert_eq!(response.buckets[0].key, "42");
    }
}
