//! Command handler functions for the flakrs CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::collector::{self, CollectorConfig};
use crate::flaky::{self, FlakyQueryOptions};
use crate::ingest::xunit::XunitIngester;
use crate::ingest::{Ingester, TestReport};
use crate::model::{BuildResults, BuildStatus};
use crate::queries::{self, FailedTestsQuery, TestStatusMask};
use crate::store::SearchStore;

pub fn cmd_flaky(
    store: &dyn SearchStore,
    opts: &FlakyQueryOptions,
    json: bool,
) -> Result<String> {
    let flaky_tests = flaky::get_flaky_tests(store, opts)?;

    if json {
        return Ok(serde_json::to_string_pretty(&flaky_tests)? + "\n");
    }

    if flaky_tests.is_empty() {
        return Ok("No flaky tests found.\n".to_string());
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<50} {:>6} {:>6} {:>6} {:>6}  BATCH",
        "TEST", "SCORE", "PASS", "FAIL", "RUNS"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(100)).unwrap();
    for (class_name, by_test) in &flaky_tests {
        for (test_name, records) in by_test {
            for record in records {
                writeln!(
                    out,
                    "{:<50} {:>6.1} {:>6} {:>6} {:>6}  {}/{}/{}",
                    format!("{}.{}", class_name, test_name),
                    record.flaky_score,
                    record.num_passes,
                    record.num_failures,
                    record.num_runs,
                    record.build_version,
                    record.job_name,
                    record.platform,
                )
                .unwrap();
            }
        }
    }
    Ok(out)
}

pub fn cmd_failing(
    store: &dyn SearchStore,
    start_date: &str,
    end_date: &str,
    collector: Option<&str>,
    job_name: Option<&str>,
    json: bool,
) -> Result<String> {
    let failing = queries::get_failing_tests(store, start_date, end_date, collector, job_name)?;

    if json {
        return Ok(serde_json::to_string_pretty(&failing)? + "\n");
    }

    if failing.is_empty() {
        return Ok("No failing tests found.\n".to_string());
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<30} {:<12} {:<50} {}",
        "JOB", "BUILD", "TEST", "DATE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(110)).unwrap();
    for test in &failing {
        writeln!(
            out,
            "{:<30} {:<12} {:<50} {}",
            test.job_name,
            test.build_id,
            format!("{}.{}", test.class_name, test.test_name),
            test.build_date,
        )
        .unwrap();
    }
    Ok(out)
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value[field].as_str().unwrap_or("-")
}

fn builds_table(hits: &[Value]) -> String {
    let mut out = String::new();
    writeln!(
        out,
        "{:<30} {:<12} {:<10} {}",
        "JOB", "BUILD", "STATUS", "DATE"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(75)).unwrap();
    for hit in hits {
        writeln!(
            out,
            "{:<30} {:<12} {:<10} {}",
            str_field(hit, "br_job_name"),
            str_field(hit, "br_build_id_key"),
            str_field(hit, "br_status_key"),
            str_field(hit, "br_build_date_time"),
        )
        .unwrap();
    }
    out
}

pub fn cmd_job(
    store: &dyn SearchStore,
    job_name: &str,
    size: usize,
    start_date: &str,
    end_date: &str,
    json: bool,
) -> Result<String> {
    let hits = queries::get_job(store, job_name, size, start_date, end_date)?;

    if json {
        return Ok(serde_json::to_string_pretty(&hits)? + "\n");
    }
    if hits.is_empty() {
        return Ok(format!("No builds found for job '{}'\n", job_name));
    }
    Ok(builds_table(&hits))
}

pub fn cmd_build(store: &dyn SearchStore, job_name: &str, build_id: &str) -> Result<String> {
    match queries::get_build(store, job_name, build_id)? {
        Some(build) => Ok(serde_json::to_string_pretty(&build)? + "\n"),
        None => Ok(format!(
            "No build '{}' found for job '{}'\n",
            build_id, job_name
        )),
    }
}

pub fn cmd_failed(
    store: &dyn SearchStore,
    query: &FailedTestsQuery,
    counts: bool,
    json: bool,
) -> Result<String> {
    if counts {
        let counted = queries::failed_test_counts(store, query)?;
        if json {
            return Ok(serde_json::to_string_pretty(&counted)? + "\n");
        }
        if counted.is_empty() {
            return Ok("No failed tests found.\n".to_string());
        }
        let mut out = String::new();
        writeln!(out, "{:<70} {:>8}", "TEST", "COUNT").unwrap();
        writeln!(out, "{}", "-".repeat(79)).unwrap();
        for (fullname, count) in &counted {
            writeln!(out, "{:<70} {:>8}", fullname, count).unwrap();
        }
        return Ok(out);
    }

    let hits = queries::failed_tests(store, query)?;
    if json {
        return Ok(serde_json::to_string_pretty(&hits)? + "\n");
    }
    if hits.is_empty() {
        return Ok("No failed builds found.\n".to_string());
    }
    Ok(builds_table(&hits))
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_test(
    store: &dyn SearchStore,
    test_name: &str,
    mask: TestStatusMask,
    job_name: Option<&str>,
    size: usize,
    start_date: &str,
    end_date: &str,
    json: bool,
) -> Result<String> {
    let hits = queries::job_matching_test(
        store, test_name, mask, job_name, size, start_date, end_date,
    )?;

    if json {
        return Ok(serde_json::to_string_pretty(&hits)? + "\n");
    }
    if hits.is_empty() {
        return Ok(format!("No builds ran a test matching '{}'\n", test_name));
    }
    Ok(builds_table(&hits))
}

/// Build metadata supplied on the command line when ingesting report files
/// directly, without a CI API to ask.
#[derive(Debug, Clone)]
pub struct BuildMeta {
    pub job_name: String,
    pub build_id: String,
    pub platform: String,
    pub build_date_time: String,
    pub build_version: Option<String>,
    pub product_version: Option<String>,
    pub status: Option<String>,
}

/// Parse XUnit report files and assemble them into one storable document.
pub fn assemble_xunit_build(files: &[impl AsRef<Path>], meta: &BuildMeta) -> Result<BuildResults> {
    let mut report = TestReport::default();
    for file in files {
        let file = file.as_ref();
        let input = fs::read(file)
            .with_context(|| format!("Failed to read report file {}", file.display()))?;
        let parsed = XunitIngester
            .ingest(&input)
            .with_context(|| format!("Failed to parse report file {}", file.display()))?;
        report.merge(parsed);
    }

    let mut build = BuildResults::new(
        meta.job_name.clone(),
        None,
        meta.build_date_time.clone(),
        meta.build_id.clone(),
        meta.platform.clone(),
        None,
        meta.build_version.clone(),
        meta.product_version.clone(),
    );
    build.store_tests(report.cases, report.suites);
    if let Some(status) = &meta.status {
        build.status = Some(BuildStatus::parse(status)?);
    }
    Ok(build)
}

/// Send the assembled build to the collector, or print it when no collector
/// is configured.
pub fn deliver_build(build: &BuildResults, config: Option<&CollectorConfig>) -> Result<String> {
    match config {
        Some(config) => {
            collector::send_build(config, build)?;
            Ok(format!(
                "Sent build '{}' of job '{}' ({} tests) to {}:{}\n",
                build.build_id,
                build.job_name,
                build.tests.summary.total_count,
                config.host,
                config.port,
            ))
        }
        None => Ok(serde_json::to_string_pretty(build)? + "\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;

    fn sample_meta() -> BuildMeta {
        BuildMeta {
            job_name: "nightly-linux".to_string(),
            build_id: "1042".to_string(),
            platform: "Linux-x86_64".to_string(),
            build_date_time: "2019-04-16T22:03:41".to_string(),
            build_version: Some("B.1234.COMMIT-1234".to_string()),
            product_version: None,
            status: Some("unstable".to_string()),
        }
    }

    #[test]
    fn test_assemble_xunit_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(
            br#"<testsuites>
                <testsuite name="suite1" time="1.0">
                    <testcase classname="class1" name="test1" time="0.1"/>
                    <testcase classname="class1" name="test2" time="0.2">
                        <failure message="boom"/>
                    </testcase>
                </testsuite>
            </testsuites>"#,
        )
        .unwrap();

        let build = assemble_xunit_build(&[&path], &sample_meta()).unwrap();

        assert_eq!(build.job_name, "nightly-linux");
        assert_eq!(build.status, Some(BuildStatus::Unstable));
        assert_eq!(build.tests.summary.total_count, 2);
        assert_eq!(build.tests.summary.total_failed_count, 1);
        assert_eq!(build.tests.tests_failed[0].fullname, "suite1.test2");
        assert_eq!(
            build.build_version.as_deref(),
            Some("B.1234.COMMIT-1234")
        );
    }

    #[test]
    fn test_assemble_merges_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.xml");
        let two = dir.path().join("two.xml");
        std::fs::write(
            &one,
            r#"<testsuite name="a" time="1.0"><testcase classname="c" name="t1" time="0.1"/></testsuite>"#,
        )
        .unwrap();
        std::fs::write(
            &two,
            r#"<testsuite name="b" time="1.0"><testcase classname="c" name="t2" time="0.1"/></testsuite>"#,
        )
        .unwrap();

        let build = assemble_xunit_build(&[&one, &two], &sample_meta()).unwrap();
        assert_eq!(build.tests.summary.total_count, 2);
        assert_eq!(build.tests.suites.len(), 2);
    }

    #[test]
    fn test_assemble_missing_file_is_error() {
        let result = assemble_xunit_build(&["/does/not/exist.xml"], &sample_meta());
        assert!(result.is_err());
    }

    #[test]
    fn test_deliver_build_without_collector_prints_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        std::fs::write(
            &path,
            r#"<testsuite name="a" time="1.0"><testcase classname="c" name="t1" time="0.1"/></testsuite>"#,
        )
        .unwrap();
        let build = assemble_xunit_build(&[&path], &sample_meta()).unwrap();

        let out = deliver_build(&build, None).unwrap();
        assert!(out.contains("\"br_job_name\": \"nightly-linux\""));
        assert!(out.contains("\"br_total_count\": 1"));
    }
}
