/// Parser for XUnit/JUnit XML test reports.
///
/// XUnit XML structure:
///   <testsuites>
///     <testsuite name="..." package="..." tests="8" failures="1"
///                errors="0" skipped="2" time="12.5">
///       <testcase classname="..." name="..." time="0.42">
///         <failure message="...">stack trace</failure>
///         <error message="..."/>
///         <skipped/>
///       </testcase>
///     </testsuite>
///   </testsuites>
///
/// A case with no child element passed. Suite tallies are recomputed from
/// the cases rather than trusted from the testsuite attributes; generators
/// disagree about whether errors count into failures.
use std::collections::HashMap;
use std::str;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{FlakrsError, Result};
use crate::ingest::{Ingester, TestReport};
use crate::model::{normalize_test_name, SuiteResult, TestCase, TestResult};

pub struct XunitIngester;

impl Ingester for XunitIngester {
    fn ingest(&self, input: &[u8]) -> Result<TestReport> {
        parse_xunit(input)
    }
}

struct SuiteState {
    name: String,
    package: Option<String>,
    duration: f64,
    failed: u64,
    passed: u64,
    skipped: u64,
}

struct CaseState {
    classname: String,
    name: String,
    duration: f64,
    result: TestResult,
    message: String,
}

fn parse_xunit(input: &[u8]) -> Result<TestReport> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut report = TestReport::default();
    let mut buf = Vec::new();

    let mut current_suite: Option<SuiteState> = None;
    let mut current_case: Option<CaseState> = None;
    let mut open_elements = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf);
        let is_empty_event = matches!(&event, Ok(Event::Empty(_)));
        match event {
            Err(source) => {
                return Err(FlakrsError::Xml {
                    source,
                    position: reader.buffer_position(),
                })
            }
            Ok(Event::Eof) => {
                // quick-xml reports EOF without error even when elements
                // are still open; a truncated report must not pass as a
                // complete one.
                if open_elements > 0 {
                    return Err(FlakrsError::Parse(format!(
                        "unexpected end of XML input at position {} with {} unclosed element(s)",
                        reader.buffer_position(),
                        open_elements
                    )));
                }
                break;
            }
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if !is_empty_event {
                    open_elements += 1;
                }
                let local_name = e.name();
                let local = local_name.as_ref().to_vec();

                match local.as_slice() {
                    b"testsuite" => {
                        let attrs = attr_map(e, reader.buffer_position())?;
                        current_suite = Some(SuiteState {
                            name: normalize_test_name(attrs.get("name").map_or("", |s| s)),
                            package: attrs.get("package").cloned(),
                            duration: attrs
                                .get("time")
                                .and_then(|t| t.parse::<f64>().ok())
                                .unwrap_or(0.0),
                            failed: 0,
                            passed: 0,
                            skipped: 0,
                        });
                    }
                    b"testcase" => {
                        let attrs = attr_map(e, reader.buffer_position())?;
                        let case = CaseState {
                            classname: normalize_test_name(
                                attrs.get("classname").map_or("", |s| s),
                            ),
                            name: normalize_test_name(attrs.get("name").map_or("", |s| s)),
                            duration: attrs
                                .get("time")
                                .and_then(|t| t.parse::<f64>().ok())
                                .unwrap_or(0.0),
                            result: TestResult::Passed,
                            message: String::new(),
                        };
                        if is_empty_event {
                            // Self-closing case: no result child, so it passed.
                            finish_case(case, current_suite.as_mut(), &mut report);
                        } else {
                            current_case = Some(case);
                        }
                    }
                    b"failure" | b"error" => {
                        if let Some(case) = current_case.as_mut() {
                            case.result = TestResult::Failed;
                            let attrs = attr_map(e, reader.buffer_position())?;
                            if let Some(message) = attrs.get("message") {
                                case.message = normalize_test_name(message);
                            }
                        }
                    }
                    b"skipped" => {
                        if let Some(case) = current_case.as_mut() {
                            case.result = TestResult::Skipped;
                            let attrs = attr_map(e, reader.buffer_position())?;
                            if let Some(message) = attrs.get("message") {
                                case.message = normalize_test_name(message);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                open_elements = open_elements.saturating_sub(1);
                let local_name = e.name();
                let local = local_name.as_ref().to_vec();
                match local.as_slice() {
                    b"testcase" => {
                        if let Some(case) = current_case.take() {
                            finish_case(case, current_suite.as_mut(), &mut report);
                        }
                    }
                    b"testsuite" => {
                        if let Some(suite) = current_suite.take() {
                            report.suites.push(SuiteResult {
                                name: suite.name,
                                failures_count: suite.failed,
                                skipped_count: suite.skipped,
                                passed_count: suite.passed,
                                total_count: suite.failed + suite.passed + suite.skipped,
                                duration: suite.duration,
                                package: suite.package,
                            });
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(report)
}

fn finish_case(case: CaseState, suite: Option<&mut SuiteState>, report: &mut TestReport) {
    let Some(suite) = suite else {
        // Case outside any suite; nothing to attribute it to.
        return;
    };

    match case.result {
        TestResult::Failed => suite.failed += 1,
        TestResult::Passed => suite.passed += 1,
        TestResult::Skipped => suite.skipped += 1,
    }

    report.cases.push(TestCase::new(
        suite.name.clone(),
        case.classname,
        case.name,
        case.result,
        case.message,
        case.duration,
        None,
    ));
}

/// Extract attributes from an XML element into a HashMap. Syntactically
/// invalid attributes are errors, not omissions.
fn attr_map(e: &quick_xml::events::BytesStart, position: usize) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| {
            FlakrsError::Parse(format!("bad XML attribute at position {}: {}", position, err))
        })?;
        let key = str::from_utf8(attr.key.local_name().into_inner())
            .map_err(|err| {
                FlakrsError::Parse(format!(
                    "non-UTF-8 XML attribute name at position {}: {}",
                    position, err
                ))
            })?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|source| FlakrsError::Xml { source, position })?
            .to_string();
        attrs.insert(key, value);
    }
    Ok(attrs)
}
