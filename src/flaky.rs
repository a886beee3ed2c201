//! Flaky-test detection over historical build entries.
//!
//! Builds are grouped into batches keyed by (build-version, job-name,
//! platform) within a queried time window; entries in a batch are repeated
//! runs of the same configuration. A test is flaky within a batch when it
//! both failed and passed across those runs.
//!
//! The analysis is two-phase by design: failing-test detail is rare and
//! cheap, so one bulk query fetches every failure in the batch; passing-test
//! detail is large, so passes are counted lazily with one cheap count-only
//! aggregation per surviving candidate test, and only for tests that the
//! failure tally could not already exclude.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FlakrsError, Result};
use crate::query::{Aggregation, Filter};
use crate::store::{SearchRequest, SearchStore};

/// Ceiling on distinct bucket values per aggregation level and on fetched
/// records. Results past the ceiling silently truncate.
pub const MAX_RECORDS: usize = 10_000;

/// Upper bound on concurrent phase-2 pass-count queries per batch.
const MAX_CONCURRENT_QUERIES: usize = 8;

/// Projection for aggregation-only queries.
const AGG_INCLUDES: &[&str] = &["_id"];
const AGG_EXCLUDES: &[&str] = &[];

/// Projection for the bulk failed-entry fetch: batch metadata plus the
/// identity fields of each failed test.
const JOB_INCLUDES: &[&str] = &[
    "br_build_date_time",
    "br_job_name",
    "br_job_info",
    "br_build_id_key",
    "br_product_version_key",
    "br_tests_object.br_tests_failed_object.br_test",
    "br_tests_object.br_tests_failed_object.br_classname",
    "br_tests_object.br_tests_failed_object.br_reportset",
];
const JOB_EXCLUDES: &[&str] = &["lhi*"];

/// Scope of a flaky analysis run.
#[derive(Debug, Clone)]
pub struct FlakyQueryOptions {
    /// Store-native date expression, absolute or relative.
    pub start_date: String,
    pub end_date: String,
    pub collector: Option<String>,
    /// Exact job name, or a wildcard pattern containing `*`.
    pub job_name: Option<String>,
    /// Exact platform, or a wildcard pattern containing `*`.
    pub platform: Option<String>,
}

impl Default for FlakyQueryOptions {
    fn default() -> Self {
        Self {
            start_date: "now-7d".to_string(),
            end_date: "now".to_string(),
            collector: None,
            job_name: None,
            platform: None,
        }
    }
}

/// Failure/pass totals of one entry, from the batch aggregation metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryCounts {
    pub id: String,
    pub num_failed_tests: u64,
    pub num_passed_tests: u64,
}

/// One batch: build-id → entries recorded under that build.
pub type Batch = BTreeMap<String, Vec<EntryCounts>>;

/// All batches in the window: build-version → job-name → platform → batch.
pub type BatchTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, Batch>>>;

/// Entry IDs selected from an eligible batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSelection {
    /// Total entry count across all build-ids of the batch.
    pub num_runs: u64,
    /// Entries with at least one failed or passed test.
    pub entry_ids: Vec<String>,
    /// Entries with at least one failed test.
    pub failed_ids: Vec<String>,
}

/// Per-build metadata attached to every flaky record of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildInfo {
    pub build_id: String,
    pub build_date_time: String,
}

/// Flakiness of one (class, test) pair within one batch.
#[derive(Debug, Clone, Serialize)]
pub struct FlakyRecord {
    pub class_name: String,
    pub test_name: String,
    pub report_set: String,
    pub num_passes: u64,
    pub num_failures: u64,
    /// Inferred, not measured: num_runs − num_passes − num_failures.
    /// Negative only when the underlying data is internally inconsistent.
    pub num_skipped: i64,
    pub num_runs: u64,
    pub flaky_score: f64,
    pub build_version: String,
    pub job_name: String,
    pub platform: String,
    pub product_version: String,
    /// Every build-id of the batch that contributed failing entries.
    pub builds: Vec<BuildInfo>,
}

/// Global result: class name → test name → one record per batch in which
/// the test was flaky, in batch processing order.
pub type FlakyTree = BTreeMap<String, BTreeMap<String, Vec<FlakyRecord>>>;

/// Analysis state of one batch before merging into the global tree.
/// Excluded tests hold `None`.
#[derive(Debug, Default)]
pub struct BatchFlakyData {
    pub build_version: String,
    pub job_name: String,
    pub platform: String,
    pub product_version: String,
    pub builds: BTreeMap<String, BuildInfo>,
    pub tests: BTreeMap<String, BTreeMap<String, Option<FlakyRecord>>>,
}

/// 200·min(p,f)/(p+f): 0 when a test never both passed and failed, rising
/// to 100 as the split over definitive results approaches 50/50.
pub fn flaky_score(num_passes: u64, num_failures: u64) -> f64 {
    let total = num_passes + num_failures;
    if total == 0 {
        return 0.0;
    }
    200.0 * num_passes.min(num_failures) as f64 / total as f64
}

/// Group historical entries into batches with one 5-level aggregation
/// query: build-version → job-name → platform → build-id → entry-id, the
/// deepest level carrying summed failed/passed test counts per entry.
pub fn get_batches(store: &dyn SearchStore, opts: &FlakyQueryOptions) -> Result<BatchTree> {
    let mut filter = Filter::date_range("br_build_date_time", &opts.start_date, &opts.end_date);
    if let Some(collector) = &opts.collector {
        filter = filter.and(Filter::match_field("collector", collector));
    }
    if let Some(job_name) = &opts.job_name {
        filter = filter.and(Filter::term_or_wildcard("br_job_name.raw", job_name));
    }
    if let Some(platform) = &opts.platform {
        filter = filter.and(Filter::term_or_wildcard("br_platform.raw", platform));
    }

    let agg = Aggregation::terms("build_versions", "br_job_info.raw", MAX_RECORDS).bucket(
        Aggregation::terms("job_names", "br_job_name.raw", MAX_RECORDS).bucket(
            Aggregation::terms("platforms", "br_platform.raw", MAX_RECORDS).bucket(
                Aggregation::terms("build_ids", "br_build_id_key", MAX_RECORDS).bucket(
                    Aggregation::terms("ids", "_id", MAX_RECORDS)
                        .metric(
                            "num_failed_tests",
                            "br_tests_object.br_summary_object.br_total_failed_count",
                        )
                        .metric(
                            "num_passed_tests",
                            "br_tests_object.br_summary_object.br_total_passed_count",
                        ),
                ),
            ),
        ),
    );

    let request = SearchRequest::new(filter)
        .source(AGG_INCLUDES, AGG_EXCLUDES)
        .size(0)
        .aggregate(agg);
    let response = store.search(&request)?;

    let mut batches = BatchTree::new();
    let mut num_entries = 0usize;

    for build_version in &response.buckets {
        let jobs = batches.entry(build_version.key.clone()).or_default();
        for job in &build_version.sub {
            let platforms = jobs.entry(job.key.clone()).or_default();
            for platform in &job.sub {
                let batch = platforms.entry(platform.key.clone()).or_default();
                for build_id in &platform.sub {
                    let entries = batch.entry(build_id.key.clone()).or_default();
                    for entry in &build_id.sub {
                        num_entries += 1;
                        entries.push(EntryCounts {
                            id: entry.key.clone(),
                            num_failed_tests: entry
                                .sums
                                .get("num_failed_tests")
                                .copied()
                                .unwrap_or(0.0) as u64,
                            num_passed_tests: entry
                                .sums
                                .get("num_passed_tests")
                                .copied()
                                .unwrap_or(0.0) as u64,
                        });
                    }
                }
            }
        }
    }

    debug!(num_entries, "collected batch aggregation");
    Ok(batches)
}

/// Decide eligibility of a batch and pick the entry IDs worth fetching.
///
/// Returns `None` when the batch must be skipped entirely: fewer than two
/// runs, no entries with any result, or no failed entries. Skipped batches
/// trigger no further queries and contribute nothing to the output.
pub fn select_batch_entries(batch: &Batch) -> Option<BatchSelection> {
    let num_runs: u64 = batch.values().map(|entries| entries.len() as u64).sum();
    if num_runs < 2 {
        return None;
    }

    let mut entry_ids = Vec::new();
    let mut failed_ids = Vec::new();
    for entries in batch.values() {
        for entry in entries {
            if entry.num_failed_tests > 0 {
                failed_ids.push(entry.id.clone());
                entry_ids.push(entry.id.clone());
            } else if entry.num_passed_tests > 0 {
                entry_ids.push(entry.id.clone());
            }
        }
    }

    if entry_ids.is_empty() || failed_ids.is_empty() {
        return None;
    }

    Some(BatchSelection {
        num_runs,
        entry_ids,
        failed_ids,
    })
}

/// One fetched entry, projected down to the fields the tally needs.
#[derive(Debug, Clone, Deserialize)]
pub struct FailedEntry {
    #[serde(rename = "br_build_id_key")]
    pub build_id: String,
    #[serde(rename = "br_build_date_time", default)]
    pub build_date_time: String,
    #[serde(rename = "br_product_version_key", default)]
    pub product_version: Option<String>,
    #[serde(rename = "br_tests_object", default)]
    pub tests: FailedTests,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailedTests {
    #[serde(rename = "br_tests_failed_object", default)]
    pub failed: Vec<FailedTest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailedTest {
    #[serde(rename = "br_classname", default = "unnamed")]
    pub classname: String,
    #[serde(rename = "br_test", default = "unnamed")]
    pub test: String,
    #[serde(rename = "br_reportset", default)]
    pub reportset: String,
}

fn unnamed() -> String {
    "none".to_string()
}

/// Bulk-fetch the failed entries of a batch, grouped by build-id.
pub fn fetch_failed_entries(
    store: &dyn SearchStore,
    failed_ids: &[String],
) -> Result<BTreeMap<String, Vec<FailedEntry>>> {
    let request = SearchRequest::new(Filter::ids(failed_ids.iter().cloned()))
        .source(JOB_INCLUDES, JOB_EXCLUDES)
        .size(MAX_RECORDS);
    let response = store.search(&request)?;
    debug!(hits = response.hits.len(), "fetched failed entries");

    let mut grouped: BTreeMap<String, Vec<FailedEntry>> = BTreeMap::new();
    for hit in response.hits {
        let entry: FailedEntry = serde_json::from_value(hit.source)?;
        grouped.entry(entry.build_id.clone()).or_default().push(entry);
    }
    Ok(grouped)
}

/// Count, among the given entries, those where the test appears in the
/// passed-tests list. Count-only aggregation, never a document fetch.
fn passes_in_batch(
    store: &dyn SearchStore,
    entry_ids: &[String],
    class_name: &str,
    test_name: &str,
) -> Result<u64> {
    let fullname = format!("{}.{}", class_name, test_name);
    let filter = Filter::ids(entry_ids.iter().cloned()).and(Filter::match_field(
        "br_tests_object.br_tests_passed_object.br_fullname.raw",
        &fullname,
    ));
    let request = SearchRequest::new(filter)
        .source(AGG_INCLUDES, AGG_EXCLUDES)
        .size(0)
        .aggregate(Aggregation::terms("ids", "_id", MAX_RECORDS));
    let response = store.search(&request)?;
    Ok(response.buckets.len() as u64)
}

/// Record one failing occurrence of a test into the batch tally.
fn tally_failing_test(
    num_runs: u64,
    tally: &mut BTreeMap<String, BTreeMap<String, FlakyRecord>>,
    test: &FailedTest,
) -> Result<()> {
    let record = tally
        .entry(test.classname.clone())
        .or_default()
        .entry(test.test.clone())
        .or_insert_with(|| FlakyRecord {
            class_name: test.classname.clone(),
            test_name: test.test.clone(),
            report_set: test.reportset.clone(),
            num_passes: 0,
            num_failures: 0,
            num_skipped: 0,
            num_runs,
            flaky_score: 0.0,
            build_version: String::new(),
            job_name: String::new(),
            platform: String::new(),
            product_version: String::new(),
            builds: Vec::new(),
        });

    // Same (class, test) with a different report set inside one batch means
    // the grouping-key assumption no longer holds; abort the whole run.
    if record.report_set != test.reportset {
        return Err(FlakrsError::ReportSetChanged {
            class_name: test.classname.clone(),
            test_name: test.test.clone(),
            expected: record.report_set.clone(),
            found: test.reportset.clone(),
        });
    }

    record.num_failures += 1;
    record.flaky_score = flaky_score(record.num_passes, record.num_failures);
    Ok(())
}

/// Phase-2 pass-count backfill for surviving candidates, fanned out over a
/// bounded scoped worker pool. Results come back in candidate order, so the
/// output stays deterministic regardless of completion order.
fn backfill_pass_counts(
    store: &dyn SearchStore,
    entry_ids: &[String],
    candidates: &[(String, String)],
) -> Result<Vec<u64>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let workers = MAX_CONCURRENT_QUERIES.min(candidates.len());
    let chunk_size = candidates.len().div_ceil(workers);
    let mut counts = Vec::with_capacity(candidates.len());

    std::thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = candidates
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|(class_name, test_name)| {
                            passes_in_batch(store, entry_ids, class_name, test_name)
                        })
                        .collect::<Result<Vec<u64>>>()
                })
            })
            .collect();

        for handle in handles {
            let chunk_counts = handle
                .join()
                .map_err(|_| FlakrsError::Other("pass-count worker panicked".to_string()))??;
            counts.extend(chunk_counts);
        }
        Ok(())
    })?;

    Ok(counts)
}

/// Analyze one batch: tally failures from the fetched failed entries, then
/// backfill pass counts for candidates the tally could not exclude.
///
/// Exclusions (record set to `None`, no query issued where noted):
/// - a test that failed in every run of the batch (no query),
/// - a test with zero observed passes after backfill.
pub fn flaky_data_for_batch(
    store: &dyn SearchStore,
    failed_entries_by_build: &BTreeMap<String, Vec<FailedEntry>>,
    build_version: &str,
    job_name: &str,
    platform: &str,
    num_runs: u64,
    entry_ids: &[String],
) -> Result<BatchFlakyData> {
    let mut data = BatchFlakyData {
        build_version: build_version.to_string(),
        job_name: job_name.to_string(),
        platform: platform.to_string(),
        ..Default::default()
    };

    // Phase 1: failure tally. No extra queries; everything needed is in the
    // already-fetched failed entries.
    let mut tally: BTreeMap<String, BTreeMap<String, FlakyRecord>> = BTreeMap::new();
    for (build_id, entries) in failed_entries_by_build {
        data.builds.insert(
            build_id.clone(),
            BuildInfo {
                build_id: build_id.clone(),
                build_date_time: String::new(),
            },
        );

        for entry in entries {
            if let Some(version) = &entry.product_version {
                // Batch-invariant metadata, picked up from any entry that has it.
                data.product_version = version.clone();
            }
            if let Some(build) = data.builds.get_mut(build_id) {
                build.build_date_time = entry.build_date_time.clone();
            }
            for test in &entry.tests.failed {
                tally_failing_test(num_runs, &mut tally, test)?;
            }
        }
    }

    // Phase 2: collect candidates still in play, then backfill their pass
    // counts. Tests that failed every run are excluded without a query.
    let mut candidates = Vec::new();
    for (class_name, by_test) in tally {
        let slots = data.tests.entry(class_name.clone()).or_default();
        for (test_name, record) in by_test {
            if record.num_failures == num_runs {
                slots.insert(test_name, None);
            } else {
                candidates.push((class_name.clone(), test_name.clone()));
                slots.insert(test_name, Some(record));
            }
        }
    }

    let pass_counts = backfill_pass_counts(store, entry_ids, &candidates)?;

    // Candidates were collected in map order, so the surviving `Some` slots
    // line up with the returned counts one to one.
    let mut counts = pass_counts.into_iter();
    for by_test in data.tests.values_mut() {
        for slot in by_test.values_mut() {
            let Some(record) = slot.as_mut() else {
                continue;
            };
            let Some(num_passes) = counts.next() else {
                return Err(FlakrsError::Other(
                    "pass-count backfill returned too few results".to_string(),
                ));
            };
            if num_passes == 0 {
                *slot = None;
                continue;
            }
            record.num_passes = num_passes;
            record.num_skipped = num_runs as i64 - num_passes as i64 - record.num_failures as i64;
            record.flaky_score = flaky_score(record.num_passes, record.num_failures);
            debug!(
                class_name = %record.class_name,
                test_name = %record.test_name,
                num_runs,
                num_passes,
                num_failures = record.num_failures,
                "flaky test found"
            );
        }
    }

    Ok(data)
}

/// Merge one batch's surviving records into the global tree, stamping each
/// record with the batch metadata and the per-build list.
pub fn merge_batch_flaky_data(data: BatchFlakyData, flaky_tests: &mut FlakyTree) {
    let builds: Vec<BuildInfo> = data.builds.into_values().collect();

    for (class_name, by_test) in data.tests {
        for (test_name, slot) in by_test {
            let Some(mut record) = slot else {
                continue;
            };

            record.build_version = data.build_version.clone();
            record.job_name = data.job_name.clone();
            record.platform = data.platform.clone();
            record.product_version = data.product_version.clone();
            record.builds = builds.clone();

            flaky_tests
                .entry(class_name.clone())
                .or_default()
                .entry(test_name)
                .or_default()
                .push(record);
        }
    }
}

/// Run the whole pipeline: batch, validate, analyze and merge every
/// eligible batch in the window. Ineligible batches are skipped silently;
/// any store error or in-batch data-integrity violation aborts the run.
pub fn get_flaky_tests(store: &dyn SearchStore, opts: &FlakyQueryOptions) -> Result<FlakyTree> {
    let batches = get_batches(store, opts)?;

    let mut flaky_tests = FlakyTree::new();

    for (build_version, jobs) in &batches {
        for (job_name, platforms) in jobs {
            for (platform, batch) in platforms {
                let Some(selection) = select_batch_entries(batch) else {
                    continue;
                };

                info!(
                    build_version = %build_version,
                    job_name = %job_name,
                    platform = %platform,
                    num_runs = selection.num_runs,
                    num_entries = selection.entry_ids.len(),
                    "analyzing batch"
                );

                let failed_entries = fetch_failed_entries(store, &selection.failed_ids)?;
                let data = flaky_data_for_batch(
                    store,
                    &failed_entries,
                    build_version,
                    job_name,
                    platform,
                    selection.num_runs,
                    &selection.entry_ids,
                )?;
                merge_batch_flaky_data(data, &mut flaky_tests);
            }
        }
    }

    Ok(flaky_tests)
}
