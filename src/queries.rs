//! Prepacked queries over the build-results index.
//!
//! These are the direct lookups the CLI exposes next to the flaky engine:
//! job and build retrieval, failed-test searches and flattened failing-test
//! records. Each query is a single round-trip built from the shared
//! projection lists below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::flaky::MAX_RECORDS;
use crate::query::{Aggregation, Filter};
use crate::store::{SearchRequest, SearchStore};

/// Common job details, without the bulky passing/skipped test lists.
const DETAILED_JOB_INCLUDES: &[&str] = &[
    "br_build_date_time",
    "br_job_name",
    "br_job_url_key",
    "br_source",
    "br_build_id_key",
    "br_platform",
    "br_product",
    "br_status_key",
    "br_version_key",
    "br_tests_object",
];
const DETAILED_JOB_EXCLUDES: &[&str] = &[
    "lhi*",
    "br_tests_object.br_tests_passed_object.*",
    "br_tests_object.br_tests_skipped_object.*",
    "br_tests_object.br_suites_object.*",
];

const JOB_MINIMAL_INCLUDES: &[&str] = &[
    "br_job_name",
    "br_build_id_key",
    "br_status_key",
    "br_build_date_time",
];
const JOB_MINIMAL_EXCLUDES: &[&str] = &[];

/// Projection for failing-test extraction: batch metadata plus the failed
/// test detail fields.
const FAILING_TEST_INCLUDES: &[&str] = &[
    "br_build_date_time",
    "br_job_name",
    "br_job_info",
    "collector",
    "br_product",
    "br_build_id_key",
    "br_platform",
    "br_product_version_key",
    "br_tests_object.br_tests_failed_object.br_test",
    "br_tests_object.br_tests_failed_object.br_classname",
    "br_tests_object.br_tests_failed_object.br_fullname",
    "br_tests_object.br_tests_failed_object.br_message",
    "br_tests_object.br_tests_failed_object.br_duration",
    "br_tests_object.br_tests_failed_object.br_reportset",
];
const FAILING_TEST_EXCLUDES: &[&str] = &["lhi*"];

/// Fetch a single build by job name and build-id. Both accept `*` wildcards.
/// Returns `None` when nothing matched.
pub fn get_build(
    store: &dyn SearchStore,
    job_name: &str,
    build_id: &str,
) -> Result<Option<Value>> {
    let filter = Filter::term_or_wildcard("br_job_name.raw", job_name)
        .and(Filter::term_or_wildcard("br_build_id_key", build_id));
    let request = SearchRequest::new(filter)
        .source(DETAILED_JOB_INCLUDES, DETAILED_JOB_EXCLUDES)
        .size(1);
    let response = store.search(&request)?;
    Ok(response.hits.into_iter().next().map(|hit| hit.source))
}

/// List the builds recorded for a job within a time window. The job name
/// accepts `*` wildcards.
pub fn get_job(
    store: &dyn SearchStore,
    job_name: &str,
    size: usize,
    start_date: &str,
    end_date: &str,
) -> Result<Vec<Value>> {
    let filter = Filter::term_or_wildcard("br_job_name.raw", job_name)
        .and(Filter::date_range("br_build_date_time", start_date, end_date));
    let request = SearchRequest::new(filter)
        .source(DETAILED_JOB_INCLUDES, DETAILED_JOB_EXCLUDES)
        .size(size);
    let response = store.search(&request)?;
    Ok(response.hits.into_iter().map(|hit| hit.source).collect())
}

/// Parameters for [`failed_tests`] and [`failed_test_counts`].
#[derive(Debug, Clone)]
pub struct FailedTestsQuery {
    /// Restrict to one job (exact name). `None` searches every job.
    pub job_name: Option<String>,
    pub size: usize,
    /// Minimum summary failure count for an entry to qualify.
    pub fail_count: u64,
    /// Optional (low, high) bound on failed-test durations in seconds.
    pub duration: Option<(f64, f64)>,
    pub start_date: String,
    pub end_date: String,
}

impl Default for FailedTestsQuery {
    fn default() -> Self {
        Self {
            job_name: None,
            size: 10,
            fail_count: 5,
            duration: None,
            start_date: "now-7d".to_string(),
            end_date: "now".to_string(),
        }
    }
}

fn failed_tests_filter(query: &FailedTestsQuery) -> Filter {
    let status = Filter::match_field("br_status_key", "FAILURE")
        .or(Filter::match_field("br_status_key", "UNSTABLE"));
    let mut filter = status
        .and(Filter::date_range(
            "br_build_date_time",
            &query.start_date,
            &query.end_date,
        ))
        .and(Filter::gte(
            "br_tests_object.br_summary_object.br_total_failed_count",
            query.fail_count,
        ));
    if let Some((low, high)) = query.duration {
        filter = filter.and(Filter::between(
            "br_tests_object.br_tests_failed_object.br_duration",
            low,
            high,
        ));
    }
    if let Some(job_name) = &query.job_name {
        filter = filter.and(Filter::term("br_job_name.raw", job_name));
    }
    filter
}

/// Entries of failed or unstable builds carrying at least `fail_count`
/// failed tests, optionally narrowed to a duration band and a job.
pub fn failed_tests(store: &dyn SearchStore, query: &FailedTestsQuery) -> Result<Vec<Value>> {
    let request = SearchRequest::new(failed_tests_filter(query))
        .source(DETAILED_JOB_INCLUDES, DETAILED_JOB_EXCLUDES)
        .size(query.size);
    let response = store.search(&request)?;
    debug!(hits = response.hits.len(), "failed-tests query");
    Ok(response.hits.into_iter().map(|hit| hit.source).collect())
}

/// Same filter as [`failed_tests`], aggregated into per-test occurrence
/// counts keyed by test fullname.
pub fn failed_test_counts(
    store: &dyn SearchStore,
    query: &FailedTestsQuery,
) -> Result<Vec<(String, u64)>> {
    let agg = Aggregation::terms(
        "fail_count",
        "br_tests_object.br_tests_failed_object.br_fullname.raw",
        MAX_RECORDS,
    );
    let request = SearchRequest::new(failed_tests_filter(query))
        .source(DETAILED_JOB_INCLUDES, DETAILED_JOB_EXCLUDES)
        .size(0)
        .aggregate(agg);
    let response = store.search(&request)?;
    Ok(response
        .buckets
        .into_iter()
        .map(|bucket| (bucket.key, bucket.doc_count))
        .collect())
}

/// Which result lists [`job_matching_test`] searches.
#[derive(Debug, Clone, Copy)]
pub struct TestStatusMask {
    pub passed: bool,
    pub failed: bool,
    pub skipped: bool,
}

impl Default for TestStatusMask {
    fn default() -> Self {
        Self {
            passed: true,
            failed: true,
            skipped: false,
        }
    }
}

/// Find entries containing a test whose fullname matches the given pattern
/// (wildcards allowed) in any of the selected result lists.
pub fn job_matching_test(
    store: &dyn SearchStore,
    test_name: &str,
    mask: TestStatusMask,
    job_name: Option<&str>,
    size: usize,
    start_date: &str,
    end_date: &str,
) -> Result<Vec<Value>> {
    let mut filter = Filter::date_range("br_build_date_time", start_date, end_date);

    let mut status_filter: Option<Filter> = None;
    let add = |field: &str, current: Option<Filter>| {
        let clause = Filter::wildcard(field, test_name);
        Some(match current {
            Some(existing) => existing.or(clause),
            None => clause,
        })
    };
    if mask.passed {
        status_filter = add(
            "br_tests_object.br_tests_passed_object.br_fullname.raw",
            status_filter,
        );
    }
    if mask.failed {
        status_filter = add(
            "br_tests_object.br_tests_failed_object.br_fullname.raw",
            status_filter,
        );
    }
    if mask.skipped {
        status_filter = add(
            "br_tests_object.br_tests_skipped_object.br_fullname.raw",
            status_filter,
        );
    }
    if let Some(status_filter) = status_filter {
        filter = filter.and(status_filter);
    }
    if let Some(job_name) = job_name {
        filter = filter.and(Filter::term("br_job_name.raw", job_name));
    }

    let request = SearchRequest::new(filter)
        .source(JOB_MINIMAL_INCLUDES, JOB_MINIMAL_EXCLUDES)
        .size(size);
    let response = store.search(&request)?;
    Ok(response.hits.into_iter().map(|hit| hit.source).collect())
}

/// One failing test occurrence, flattened with its entry's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FailingTest {
    pub status: &'static str,
    pub collector: String,
    pub build_id: String,
    pub product: String,
    pub platform: String,
    pub job_name: String,
    pub build_date: String,
    pub build_version: String,
    pub product_version: String,
    pub test_name: String,
    pub class_name: String,
    pub error_message: String,
    pub duration: f64,
    pub report_set: String,
}

#[derive(Debug, Deserialize)]
struct FailingEntry {
    #[serde(rename = "br_build_date_time", default = "missing")]
    build_date_time: String,
    #[serde(rename = "br_job_name", default = "missing")]
    job_name: String,
    #[serde(rename = "br_job_info", default = "missing")]
    build_version: String,
    #[serde(default = "missing")]
    collector: String,
    #[serde(rename = "br_product", default = "missing")]
    product: String,
    #[serde(rename = "br_build_id_key", default = "missing")]
    build_id: String,
    #[serde(rename = "br_platform", default = "missing")]
    platform: String,
    #[serde(rename = "br_product_version_key", default = "missing")]
    product_version: String,
    #[serde(rename = "br_tests_object", default)]
    tests: FailingEntryTests,
}

#[derive(Debug, Default, Deserialize)]
struct FailingEntryTests {
    #[serde(rename = "br_tests_failed_object", default)]
    failed: Vec<FailingTestDetail>,
}

#[derive(Debug, Deserialize)]
struct FailingTestDetail {
    #[serde(rename = "br_test", default = "missing")]
    test: String,
    #[serde(rename = "br_classname", default = "missing")]
    classname: String,
    #[serde(rename = "br_message", default = "missing")]
    message: String,
    #[serde(rename = "br_duration", default)]
    duration: f64,
    #[serde(rename = "br_reportset", default = "missing")]
    reportset: String,
}

fn missing() -> String {
    "none".to_string()
}

/// Every failing test in the window, one flat record per occurrence, in
/// store return order.
pub fn get_failing_tests(
    store: &dyn SearchStore,
    start_date: &str,
    end_date: &str,
    collector: Option<&str>,
    job_name: Option<&str>,
) -> Result<Vec<FailingTest>> {
    let mut filter = Filter::date_range("br_build_date_time", start_date, end_date);
    if let Some(collector) = collector {
        filter = filter.and(Filter::match_field("collector", collector));
    }
    if let Some(job_name) = job_name {
        filter = filter.and(Filter::term_or_wildcard("br_job_name.raw", job_name));
    }
    filter = filter.and(Filter::gte(
        "br_tests_object.br_summary_object.br_total_failed_count",
        1,
    ));

    let request = SearchRequest::new(filter)
        .source(FAILING_TEST_INCLUDES, FAILING_TEST_EXCLUDES)
        .size(MAX_RECORDS);
    let response = store.search(&request)?;
    debug!(hits = response.hits.len(), "failing-tests query");

    let mut failing = Vec::new();
    for hit in response.hits {
        let entry: FailingEntry = serde_json::from_value(hit.source)?;
        for test in &entry.tests.failed {
            failing.push(FailingTest {
                status: "FAILED",
                collector: entry.collector.clone(),
                build_id: entry.build_id.clone(),
                product: entry.product.clone(),
                platform: entry.platform.clone(),
                job_name: entry.job_name.clone(),
                build_date: entry.build_date_time.clone(),
                build_version: entry.build_version.clone(),
                product_version: entry.product_version.clone(),
                test_name: test.test.clone(),
                class_name: test.classname.clone(),
                error_message: test.message.clone(),
                duration: test.duration,
                report_set: test.reportset.clone(),
            });
        }
    }
    Ok(failing)
}
