pub mod jenkins;
pub mod xunit;

use crate::error::Result;
use crate::model::{SuiteResult, TestCase};

/// Intermediate form every ingester produces: the flat test cases plus the
/// per-suite tallies, ready for [`crate::model::BuildResults::store_tests`].
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub cases: Vec<TestCase>,
    pub suites: Vec<SuiteResult>,
}

impl TestReport {
    /// Concatenate another report into this one. Used when one build emits
    /// several report files.
    pub fn merge(&mut self, other: TestReport) {
        self.cases.extend(other.cases);
        self.suites.extend(other.suites);
    }
}

/// Every CI-format ingester implements this trait.
pub trait Ingester {
    /// Decode the input bytes into our uniform test report model.
    fn ingest(&self, input: &[u8]) -> Result<TestReport>;
}
