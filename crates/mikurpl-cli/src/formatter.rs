use colored::Colorize;
use mikurpl_core::{SetupOutcome, Severity, SkipOutcome, SkipReport, TopologyCheckReport, Verification};
use mikurpl_daemon::{ChannelState, DaemonState, DaemonStatus};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// 报告渲染;`verbosity` 大于 0 时展示发现的附加细节
pub struct Formatter {
    format: OutputFormat,
    color: bool,
    verbosity: u8,
}

#[derive(Tabled)]
struct ChannelRow {
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Main")]
    main: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "IO")]
    io: String,
    #[tabled(rename = "SQL")]
    sql: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Last error")]
    last_error: String,
}

#[derive(Tabled)]
struct SkipRow {
    #[tabled(rename = "Subordinate")]
    subordinate: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "GTIDs")]
    gtids: String,
}

impl Formatter {
    pub fn new(format: OutputFormat, color: bool, verbosity: u8) -> Self {
        Self {
            format,
            color,
            verbosity,
        }
    }

    fn paint(&self, text: &str, ok: bool) -> String {
        if !self.color {
            text.to_string()
        } else if ok {
            text.green().bold().to_string()
        } else {
            text.red().bold().to_string()
        }
    }

    fn yes_no(value: bool) -> String {
        if value { "Yes".into() } else { "No".into() }
    }

    pub fn check_report(&self, report: &TopologyCheckReport) -> String {
        if self.format == OutputFormat::Json {
            return serde_json::to_string_pretty(report).unwrap_or_default();
        }
        let mut out = format!("# Checking {} -> {}\n", report.main(), report.subordinate());
        for result in report.results() {
            let verdict = if result.passed() {
                self.paint("pass", true)
            } else if result.findings.iter().any(|f| f.is_fatal()) {
                self.paint("FAIL", false)
            } else {
                let warn = "WARN";
                if self.color { warn.yellow().bold().to_string() } else { warn.to_string() }
            };
            out.push_str(&format!("# {} ... {}\n", result.check.description(), verdict));
            for finding in &result.findings {
                let level = match finding.severity {
                    Severity::Fatal => "ERROR",
                    Severity::Warning => "WARNING",
                };
                out.push_str(&format!("#   {}: {}\n", level, finding.message));
                if self.verbosity > 0 {
                    for detail in &finding.details {
                        out.push_str(&format!("#     {}\n", detail));
                    }
                }
            }
        }
        out
    }

    pub fn setup_outcome(&self, outcome: &SetupOutcome) -> String {
        if self.format == OutputFormat::Json {
            let value = serde_json::json!({
                "main": outcome.link.main(),
                "subordinate": outcome.link.subordinate(),
                "status": outcome.link.status(),
                "report": &outcome.report,
                "verification": &outcome.verification,
            });
            return serde_json::to_string_pretty(&value).unwrap_or_default();
        }
        let mut out = self.check_report(&outcome.report);
        out.push_str(&format!(
            "# Replication {} -> {} is {}\n",
            outcome.link.main(),
            outcome.link.subordinate(),
            self.paint(&outcome.link.status().to_string(), true)
        ));
        match outcome.verification {
            Verification::Skipped => {}
            Verification::Passed { ref database } => {
                out.push_str(&format!("# Test database '{}' replicated ... {}\n", database, self.paint("ok", true)));
            }
            Verification::Failed {
                ref database,
                ref reason,
            } => {
                out.push_str(&format!(
                    "# Test database '{}' did not replicate ... {} ({})\n",
                    database,
                    self.paint("FAIL", false),
                    reason
                ));
            }
        }
        out
    }

    pub fn daemon_status(&self, status: &DaemonStatus) -> String {
        if self.format == OutputFormat::Json {
            return serde_json::to_string_pretty(status).unwrap_or_default();
        }
        let rows: Vec<ChannelRow> = status
            .channels
            .iter()
            .map(|c| ChannelRow {
                channel: c.channel.clone(),
                main: c.main.clone(),
                state: self.paint(&c.state.to_string(), c.state != ChannelState::Failed),
                io: Self::yes_no(c.io_running),
                sql: Self::yes_no(c.sql_running),
                attempts: c.attempts,
                last_error: c.last_error.clone().unwrap_or_default(),
            })
            .collect();
        let state = status.state.to_string();
        let mut out = format!(
            "# Daemon on subordinate {} is {}\n",
            status.subordinate,
            self.paint(&state, status.state != DaemonState::Failed)
        );
        out.push_str(&Table::new(rows).with(Style::ascii()).to_string());
        out.push('\n');
        if self.verbosity > 0 {
            for c in &status.channels {
                if let Some(ref uuid) = c.main_uuid {
                    out.push_str(&format!("# {} main uuid: {}\n", c.channel, uuid));
                }
                if let Some(ref gtid) = c.main_gtid_executed {
                    out.push_str(&format!("# {} main GTID_EXECUTED: {}\n", c.channel, gtid));
                }
            }
        }
        out
    }

    pub fn skip_report(&self, report: &SkipReport) -> String {
        if self.format == OutputFormat::Json {
            return serde_json::to_string_pretty(report).unwrap_or_default();
        }
        let rows: Vec<SkipRow> = report
            .results
            .iter()
            .map(|r| {
                let (result, gtids) = match r.outcome {
                    SkipOutcome::NothingToSkip => ("nothing to skip".to_string(), String::new()),
                    SkipOutcome::DryRun { ref to_skip } => ("would skip".to_string(), to_skip.to_string()),
                    SkipOutcome::Skipped { ref skipped } => (self.paint("skipped", true), skipped.to_string()),
                    SkipOutcome::PartiallySkipped {
                        ref applied,
                        ref failed_at,
                        ref error,
                    } => (
                        self.paint("partially skipped", false),
                        format!("{} (failed at {}: {})", applied, failed_at, error),
                    ),
                    SkipOutcome::Failed { ref error } => (self.paint("failed", false), error.clone()),
                };
                SkipRow {
                    subordinate: r.subordinate.clone(),
                    result,
                    gtids,
                }
            })
            .collect();
        let mut out = format!(
            "# {} GTID set {}\n",
            if report.dry_run { "Dry run for" } else { "Skipping" },
            report.requested
        );
        out.push_str(&Table::new(rows).with(Style::ascii()).to_string());
        out.push('\n');
        out
    }
}
