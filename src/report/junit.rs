//! JUnit XML report generation.
//!
//! One `<testcase>` per suite, with the assigned handler configuration as
//! its `classname` so CI dashboards group suites by environment:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="0" errors="1" skipped="1" time="95.210">
//!   <testsuite name="suitesched" tests="3" failures="0" errors="1" skipped="1" time="95.210">
//!     <testcase classname="aws-1" name="hello-world" time="42.100"/>
//!     <testcase classname="aws-1" name="snapshots" time="60.000">
//!       <error message="Suite exceeded its timeout" type="Timeout"/>
//!     </testcase>
//!     <testcase classname="quarantined" name="backups" time="0.000">
//!       <skipped message="All eligible handler configurations quarantined: aws-1"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::scheduler::plan::PlanSummary;
use crate::scheduler::{RunResult, SuiteReport};
use crate::suite::{SuiteRecord, SuiteStatus};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created automatically if they don't exist.
///
/// # Example
///
/// ```
/// use suitesched::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("suite-results/junit.xml".into())
///     .with_testsuite_name("system-tests");
/// ```
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "suitesched".to_string(),
        }
    }

    /// Sets the `<testsuite>` name. Defaults to `"suitesched"`.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    /// Renders the report for `run_result`.
    pub fn generate_xml(&self, run_result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = run_result.total.to_string();
        let failures = run_result
            .suites
            .iter()
            .filter(|s| s.status == SuiteStatus::Completed && s.failed)
            .count()
            .to_string();
        let errors = run_result.timed_out.to_string();
        let skipped = run_result.skipped.to_string();
        let time = format!("{:.3}", run_result.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("skipped", skipped.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", run_result.started_at.to_rfc3339().as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for suite in &run_result.suites {
            write_testcase(&mut writer, suite)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }
}

fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, suite: &SuiteReport) -> anyhow::Result<()> {
    let classname = match (&suite.assigned_config, suite.status) {
        (Some(config), _) => config.clone(),
        (None, SuiteStatus::Skipped) => "quarantined".to_string(),
        (None, _) => "unassigned".to_string(),
    };
    let time = format!(
        "{:.3}",
        suite.duration.map(|d| d.as_secs_f64()).unwrap_or_default()
    );

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", sanitize(&classname).as_str()));
    testcase.push_attribute(("name", sanitize(&suite.name).as_str()));
    testcase.push_attribute(("time", time.as_str()));

    match suite.status {
        SuiteStatus::TimedOut => {
            writer.write_event(Event::Start(testcase))?;
            let mut error = BytesStart::new("error");
            error.push_attribute(("message", "Suite exceeded its timeout"));
            error.push_attribute(("type", "Timeout"));
            writer.write_event(Event::Empty(error))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        SuiteStatus::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            let message = format!(
                "All eligible handler configurations quarantined: {}",
                suite.quarantined_configs.join(", ")
            );
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", sanitize(&message).as_str()));
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        _ if suite.failed => {
            writer.write_event(Event::Start(testcase))?;
            let message = suite
                .error
                .clone()
                .unwrap_or_else(|| "Suite reported failure".to_string());
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("message", sanitize(&message).as_str()));
            failure.push_attribute(("type", "SuiteFailure"));
            writer.write_event(Event::Start(failure))?;
            writer.write_event(Event::Text(BytesText::new(&sanitize(&message))))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        _ => {
            writer.write_event(Event::Empty(testcase))?;
        }
    }

    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _plan: &PlanSummary) {}

    async fn on_suite_start(&self, _suite: &SuiteRecord) {}

    async fn on_suite_complete(&self, _suite: &SuiteRecord) {}

    async fn on_suite_skipped(&self, _suite: &SuiteRecord) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

/// Drops characters that are not allowed in XML 1.0. Escaping is left to quick-xml.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn report(name: &str, status: SuiteStatus, config: Option<&str>, failed: bool) -> SuiteReport {
        SuiteReport {
            name: name.to_string(),
            status,
            assigned_config: config.map(String::from),
            failed,
            started_at: None,
            duration: config.map(|_| Duration::from_millis(1500)),
            error: None,
            quarantined_configs: if status == SuiteStatus::Skipped {
                vec!["aws-1".to_string()]
            } else {
                Vec::new()
            },
        }
    }

    fn run_result() -> RunResult {
        RunResult {
            run_id: "run".to_string(),
            started_at: Utc::now(),
            duration: Duration::from_secs(3),
            total: 4,
            completed: 3,
            timed_out: 1,
            skipped: 1,
            failed: 1,
            quarantined: vec!["aws-1".to_string()],
            suites: vec![
                report("hello-world", SuiteStatus::Completed, Some("aws-1"), false),
                report("snapshots", SuiteStatus::TimedOut, Some("aws-1"), false),
                report("backups", SuiteStatus::Skipped, None, false),
                report("agents <&>", SuiteStatus::Completed, Some("aws-2"), true),
            ],
        }
    }

    #[test]
    fn test_generate_xml() {
        let xml = JUnitReporter::new("junit.xml".into())
            .generate_xml(&run_result())
            .unwrap();

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"tests="4" failures="1" errors="1" skipped="1""#));
        assert!(xml.contains(r#"<testcase classname="aws-1" name="hello-world" time="1.500"/>"#));
        assert!(xml.contains(r#"type="Timeout""#));
        assert!(xml.contains(r#"classname="quarantined" name="backups""#));
        assert!(xml.contains("All eligible handler configurations quarantined: aws-1"));
        assert!(xml.contains("agents &lt;&amp;&gt;"));
        assert!(xml.contains("<failure"));
    }

    #[test]
    fn test_sanitize_drops_control_chars() {
        assert_eq!(sanitize("a\u{0}b\u{1b}c\n"), "abc\n");
    }

    #[tokio::test]
    async fn test_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/junit.xml");
        JUnitReporter::new(path.clone())
            .on_run_complete(&run_result())
            .await;
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("<testsuites"));
    }
}
