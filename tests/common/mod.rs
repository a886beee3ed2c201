//! Shared in-memory search store for integration tests.
//!
//! `MockStore` holds a flat list of build entries and answers the three
//! request shapes the engine issues: the batch aggregation, bulk fetches by
//! entry ID, and per-test pass-count aggregations. It also counts queries by
//! kind so tests can assert which round-trips were (not) issued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use flakrs::query::Filter;
use flakrs::store::{Bucket, Hit, SearchRequest, SearchResponse, SearchStore};
use flakrs::Result;

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub id: String,
    pub collector: String,
    pub build_version: String,
    pub job_name: String,
    pub platform: String,
    pub build_id: String,
    pub build_date_time: String,
    pub product_version: Option<String>,
    pub report_set: String,
    /// Failed tests as (class_name, test_name).
    pub failed: Vec<(String, String)>,
    /// Passed tests as fullnames.
    pub passed: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub fn entry(
    id: &str,
    collector: &str,
    build_version: &str,
    job_name: &str,
    platform: &str,
    build_id: &str,
    failed: &[(&str, &str)],
    passed: &[&str],
) -> MockEntry {
    MockEntry {
        id: id.to_string(),
        collector: collector.to_string(),
        build_version: build_version.to_string(),
        job_name: job_name.to_string(),
        platform: platform.to_string(),
        build_id: build_id.to_string(),
        build_date_time: "2019-04-16T22:03:41".to_string(),
        product_version: None,
        report_set: "nightly".to_string(),
        failed: failed
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect(),
        passed: passed.iter().map(|p| p.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct QueryCounts {
    pub batch: AtomicUsize,
    pub fetch: AtomicUsize,
    pub pass: AtomicUsize,
}

pub struct MockStore {
    pub entries: Vec<MockEntry>,
    pub counts: QueryCounts,
}

/// What the mock understands of a request's filter tree.
#[derive(Default)]
struct FilterView {
    collector: Option<String>,
    job_name: Option<String>,
    platform: Option<String>,
    ids: Option<Vec<String>>,
    passed_fullname: Option<String>,
    min_failed: Option<u64>,
}

fn collect_filters(filter: &Filter, view: &mut FilterView) {
    match filter {
        Filter::And(clauses) => {
            for clause in clauses {
                collect_filters(clause, view);
            }
        }
        Filter::Term { field, value } | Filter::Wildcard { field, value } => {
            match field.as_str() {
                "br_job_name.raw" => view.job_name = Some(value.clone()),
                "br_platform.raw" => view.platform = Some(value.clone()),
                _ => {}
            }
        }
        Filter::Match { field, value } => match field.as_str() {
            "collector" => view.collector = Some(value.clone()),
            "br_tests_object.br_tests_passed_object.br_fullname.raw" => {
                view.passed_fullname = Some(value.clone())
            }
            _ => {}
        },
        Filter::Ids(values) => view.ids = Some(values.clone()),
        Filter::Range { field, gte, .. } => {
            if field == "br_tests_object.br_summary_object.br_total_failed_count" {
                view.min_failed = gte.as_ref().and_then(|v| v.as_u64());
            }
        }
        Filter::Or(_) => {}
    }
}

/// Glob-style match where `*` spans any run of characters.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(stripped) => rest = stripped,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

impl MockStore {
    pub fn new(entries: Vec<MockEntry>) -> Self {
        Self {
            entries,
            counts: QueryCounts::default(),
        }
    }

    pub fn batch_queries(&self) -> usize {
        self.counts.batch.load(Ordering::Relaxed)
    }

    pub fn fetch_queries(&self) -> usize {
        self.counts.fetch.load(Ordering::Relaxed)
    }

    pub fn pass_queries(&self) -> usize {
        self.counts.pass.load(Ordering::Relaxed)
    }

    fn matching<'a>(&'a self, view: &FilterView) -> Vec<&'a MockEntry> {
        self.entries
            .iter()
            .filter(|e| {
                view.collector
                    .as_ref()
                    .map_or(true, |c| &e.collector == c)
                    && view
                        .job_name
                        .as_ref()
                        .map_or(true, |j| wildcard_match(j, &e.job_name))
                    && view
                        .platform
                        .as_ref()
                        .map_or(true, |p| wildcard_match(p, &e.platform))
                    && view
                        .ids
                        .as_ref()
                        .map_or(true, |ids| ids.contains(&e.id))
                    && view
                        .min_failed
                        .map_or(true, |min| e.failed.len() as u64 >= min)
            })
            .collect()
    }

    fn batch_aggregation(&self, view: &FilterView) -> SearchResponse {
        let mut tree: BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, Vec<&MockEntry>>>>> =
            BTreeMap::new();
        for entry in self.matching(view) {
            tree.entry(&entry.build_version)
                .or_default()
                .entry(&entry.job_name)
                .or_default()
                .entry(&entry.platform)
                .or_default()
                .entry(&entry.build_id)
                .or_default()
                .push(entry);
        }

        let buckets = tree
            .into_iter()
            .map(|(version, jobs)| Bucket {
                key: version.to_string(),
                doc_count: 0,
                sums: BTreeMap::new(),
                sub: jobs
                    .into_iter()
                    .map(|(job, platforms)| Bucket {
                        key: job.to_string(),
                        doc_count: 0,
                        sums: BTreeMap::new(),
                        sub: platforms
                            .into_iter()
                            .map(|(platform, builds)| Bucket {
                                key: platform.to_string(),
                                doc_count: 0,
                                sums: BTreeMap::new(),
                                sub: builds
                                    .into_iter()
                                    .map(|(build_id, entries)| Bucket {
                                        key: build_id.to_string(),
                                        doc_count: entries.len() as u64,
                                        sums: BTreeMap::new(),
                                        sub: entries
                                            .iter()
                                            .map(|e| {
                                                let mut sums = BTreeMap::new();
                                                sums.insert(
                                                    "num_failed_tests".to_string(),
                                                    e.failed.len() as f64,
                                                );
                                                sums.insert(
                                                    "num_passed_tests".to_string(),
                                                    e.passed.len() as f64,
                                                );
                                                Bucket {
                                                    key: e.id.clone(),
                                                    doc_count: 1,
                                                    sums,
                                                    sub: Vec::new(),
                                                }
                                            })
                                            .collect(),
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        SearchResponse {
            hits: Vec::new(),
            buckets,
        }
    }

    fn entry_source(entry: &MockEntry) -> serde_json::Value {
        let failed: Vec<_> = entry
            .failed
            .iter()
            .map(|(class_name, test_name)| {
                json!({
                    "br_classname": class_name,
                    "br_test": test_name,
                    "br_fullname": format!("{}.{}", class_name, test_name),
                    "br_message": "assertion failed",
                    "br_duration": 1.5,
                    "br_reportset": entry.report_set,
                })
            })
            .collect();

        let mut source = json!({
            "br_build_id_key": entry.build_id,
            "br_build_date_time": entry.build_date_time,
            "br_job_name": entry.job_name,
            "br_job_info": entry.build_version,
            "br_platform": entry.platform,
            "collector": entry.collector,
            "br_tests_object": { "br_tests_failed_object": failed },
        });
        if let Some(version) = &entry.product_version {
            source["br_product_version_key"] = json!(version);
        }
        source
    }
}

impl SearchStore for MockStore {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let mut view = FilterView::default();
        collect_filters(&request.filter, &mut view);

        if let Some(agg) = &request.agg {
            if agg.name == "build_versions" {
                self.counts.batch.fetch_add(1, Ordering::Relaxed);
                return Ok(self.batch_aggregation(&view));
            }
            // Per-test pass count: one bucket per matching entry.
            self.counts.pass.fetch_add(1, Ordering::Relaxed);
            let fullname = view.passed_fullname.clone().unwrap_or_default();
            let buckets = self
                .matching(&view)
                .into_iter()
                .filter(|e| e.passed.iter().any(|p| p == &fullname))
                .map(|e| Bucket {
                    key: e.id.clone(),
                    doc_count: 1,
                    sums: BTreeMap::new(),
                    sub: Vec::new(),
                })
                .collect();
            return Ok(SearchResponse {
                hits: Vec::new(),
                buckets,
            });
        }

        self.counts.fetch.fetch_add(1, Ordering::Relaxed);
        let hits = self
            .matching(&view)
            .into_iter()
            .map(|e| Hit {
                id: e.id.clone(),
                source: Self::entry_source(e),
            })
            .collect();
        Ok(SearchResponse {
            hits,
            buckets: Vec::new(),
        })
    }
}
