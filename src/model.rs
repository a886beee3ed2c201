//! Canonical representation of one CI build's results, independent of the
//! CI system that produced it. Ingestion hooks produce a `BuildResults` which
//! is then serialized to the search index (field names carry the `br_` prefix
//! of the index mapping).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FlakrsError, Result};

/// Version stamped into every stored document (`br_version_key`).
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestResult {
    Failed,
    Passed,
    Skipped,
}

impl TestResult {
    /// Normalize a CI-system result string into a [`TestResult`].
    ///
    /// Matching is case-insensitive over the known synonym sets; anything
    /// else is an error, never a silent default.
    pub fn parse(result_str: &str) -> Result<Self> {
        match result_str.to_uppercase().as_str() {
            "PASS" | "PASSED" | "SUCCESS" | "FIXED" => Ok(TestResult::Passed),
            "FAILURE" | "ERROR" | "REGRESSION" | "FAILED" => Ok(TestResult::Failed),
            "SKIP" | "SKIPPED" => Ok(TestResult::Skipped),
            _ => Err(FlakrsError::UnknownTestResult(result_str.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestResult::Failed => "FAILED",
            TestResult::Passed => "PASSED",
            TestResult::Skipped => "SKIPPED",
        }
    }
}

/// Overall status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Aborted,
    Failure,
    NotBuilt,
    Running,
    Success,
    Timeout,
    Unstable,
}

impl BuildStatus {
    /// Normalize a CI-system build status string into a [`BuildStatus`].
    pub fn parse(status_str: &str) -> Result<Self> {
        match status_str.to_uppercase().as_str() {
            "SUCCESS" | "SUCCESSFUL" => Ok(BuildStatus::Success),
            "FAILURE" | "FAILED" => Ok(BuildStatus::Failure),
            "ABORT" | "ABORTED" | "CANCEL" | "CANCELLED" => Ok(BuildStatus::Aborted),
            "NOT_BUILT" | "SKIPPED" => Ok(BuildStatus::NotBuilt),
            "UNSTABLE" => Ok(BuildStatus::Unstable),
            "TIMEOUT" | "TIMEDOUT" => Ok(BuildStatus::Timeout),
            "RUNNING" | "BUILDING" => Ok(BuildStatus::Running),
            _ => Err(FlakrsError::UnknownBuildStatus(status_str.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Aborted => "ABORTED",
            BuildStatus::Failure => "FAILURE",
            BuildStatus::NotBuilt => "NOT_BUILT",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Timeout => "TIMEOUT",
            BuildStatus::Unstable => "UNSTABLE",
        }
    }
}

/// Parameterized tests encode their parameter objects into the case name,
/// e.g. `ShapePointsTest/0 (lat = 51.8983, lon = 19.5026)` or a raw byte
/// blob for types without an output operator. Everything from the first
/// ` (` on is stripped so only the real case name and parameter index
/// remain as the test's identity.
static PARAM_BLOB_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s) \(.*$").unwrap());

pub fn normalize_test_name(value: &str) -> String {
    PARAM_BLOB_RE.replace(value, "").trim().to_string()
}

/// A single test case result within one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "br_suite")]
    pub suite: String,
    #[serde(rename = "br_classname")]
    pub classname: String,
    #[serde(rename = "br_test")]
    pub test: String,
    #[serde(rename = "br_result")]
    pub result: TestResult,
    #[serde(rename = "br_message", default)]
    pub message: String,
    /// Duration in seconds.
    #[serde(rename = "br_duration", default)]
    pub duration: f64,
    /// Sub-grouping label; stable across reruns of the same logical test.
    #[serde(rename = "br_reportset", default)]
    pub reportset: Option<String>,
    /// Suite-qualified unique identifier, `{suite}.{test}`.
    #[serde(rename = "br_fullname")]
    pub fullname: String,
}

impl TestCase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        suite: String,
        classname: String,
        test: String,
        result: TestResult,
        message: String,
        duration: f64,
        reportset: Option<String>,
    ) -> Self {
        let fullname = format!("{}.{}", suite, test);
        Self {
            suite,
            classname,
            test,
            result,
            message,
            duration,
            reportset,
            fullname,
        }
    }
}

/// Aggregate result of one test suite within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    #[serde(rename = "br_name")]
    pub name: String,
    #[serde(rename = "br_failures_count")]
    pub failures_count: u64,
    #[serde(rename = "br_skipped_count")]
    pub skipped_count: u64,
    #[serde(rename = "br_passed_count")]
    pub passed_count: u64,
    #[serde(rename = "br_total_count")]
    pub total_count: u64,
    /// Duration in seconds of the entire suite.
    #[serde(rename = "br_duration", default)]
    pub duration: f64,
    #[serde(rename = "br_package", default)]
    pub package: Option<String>,
}

/// Totals across all suites of a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSummary {
    #[serde(rename = "br_total_passed_count", default)]
    pub total_passed_count: u64,
    #[serde(rename = "br_total_failed_count", default)]
    pub total_failed_count: u64,
    #[serde(rename = "br_total_skipped_count", default)]
    pub total_skipped_count: u64,
    #[serde(rename = "br_total_count", default)]
    pub total_count: u64,
}

/// Container grouping the failed/passed/skipped tests, suites and summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsContainer {
    #[serde(rename = "br_suites_object", default)]
    pub suites: Vec<SuiteResult>,
    #[serde(rename = "br_tests_passed_object", default)]
    pub tests_passed: Vec<TestCase>,
    #[serde(rename = "br_tests_failed_object", default)]
    pub tests_failed: Vec<TestCase>,
    #[serde(rename = "br_tests_skipped_object", default)]
    pub tests_skipped: Vec<TestCase>,
    #[serde(rename = "br_summary_object", default)]
    pub summary: TestSummary,
}

/// One persisted build's worth of data, as stored in the index.
///
/// The entry ID assigned by the store is globally unique, but
/// `(build_version, job_name, platform, build_id)` is not: job reruns
/// produce multiple entries sharing it, which is what flaky analysis
/// exploits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResults {
    #[serde(rename = "br_job_name")]
    pub job_name: String,
    #[serde(rename = "br_job_url_key", default)]
    pub job_url: Option<String>,
    /// Product/job grouping key, e.g. "B.1234.COMMIT-1234".
    #[serde(rename = "br_job_info", default)]
    pub build_version: Option<String>,
    /// What triggered the job (PR id, branch name).
    #[serde(rename = "br_source", default)]
    pub source: Option<String>,
    #[serde(rename = "br_build_date_time")]
    pub build_date_time: String,
    #[serde(rename = "br_build_id_key")]
    pub build_id: String,
    #[serde(rename = "br_platform")]
    pub platform: String,
    #[serde(rename = "br_product", default)]
    pub product: Option<String>,
    #[serde(rename = "br_status_key", default)]
    pub status: Option<BuildStatus>,
    #[serde(rename = "br_tests_object", default)]
    pub tests: TestsContainer,
    #[serde(rename = "br_version_key")]
    pub schema_version: String,
    #[serde(rename = "br_product_version_key", default)]
    pub product_version: Option<String>,
}

impl BuildResults {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_name: String,
        job_url: Option<String>,
        build_date_time: String,
        build_id: String,
        platform: String,
        product: Option<String>,
        build_version: Option<String>,
        product_version: Option<String>,
    ) -> Self {
        Self {
            job_name,
            job_url,
            build_version,
            source: None,
            build_date_time,
            build_id,
            platform,
            product,
            status: None,
            tests: TestsContainer::default(),
            schema_version: SCHEMA_VERSION.to_string(),
            product_version,
        }
    }

    /// Partition test cases by result, attach the suites and compute the
    /// summary counts.
    pub fn store_tests(&mut self, cases: Vec<TestCase>, suites: Vec<SuiteResult>) {
        let mut tests = TestsContainer {
            suites,
            ..Default::default()
        };

        for case in cases {
            match case.result {
                TestResult::Passed => tests.tests_passed.push(case),
                TestResult::Failed => tests.tests_failed.push(case),
                TestResult::Skipped => tests.tests_skipped.push(case),
            }
        }

        let passed = tests.tests_passed.len() as u64;
        let failed = tests.tests_failed.len() as u64;
        let skipped = tests.tests_skipped.len() as u64;
        tests.summary = TestSummary {
            total_passed_count: passed,
            total_failed_count: failed,
            total_skipped_count: skipped,
            total_count: passed + failed + skipped,
        };

        self.tests = tests;
    }
}
