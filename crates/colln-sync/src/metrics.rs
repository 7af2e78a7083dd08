//! In-process collector counters rendered in the Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use colln_core::{DeviceType, Location, Source};
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Summary {
    sum: f64,
    count: u64,
}

impl Summary {
    fn observe(&mut self, elapsed: Duration) {
        self.sum += elapsed.as_secs_f64();
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct State {
    news_total: BTreeMap<&'static str, u64>,
    end_status: BTreeMap<&'static str, u64>,
    list_duration: BTreeMap<&'static str, Summary>,
    end_duration: Summary,
    runs_success: u64,
    runs_failure: u64,
    last_run: Option<DateTime<Utc>>,
}

/// Point-in-time view used by the status page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub source: String,
    pub device: String,
    pub news_total: u64,
    pub runs_success: u64,
    pub runs_failure: u64,
    pub last_run: Option<DateTime<Utc>>,
}

pub struct CollectorMetrics {
    source: Source,
    device: DeviceType,
    state: Mutex<State>,
}

impl CollectorMetrics {
    pub fn new(source: Source, device: DeviceType) -> Self {
        Self {
            source,
            device,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_news(&self, location: Location, count: usize) {
        *self.state().news_total.entry(location.as_str()).or_default() += count as u64;
    }

    pub fn record_end_status(&self, status: &'static str) {
        *self.state().end_status.entry(status).or_default() += 1;
    }

    pub fn observe_list(&self, location: Location, elapsed: Duration) {
        self.state()
            .list_duration
            .entry(location.as_str())
            .or_default()
            .observe(elapsed);
    }

    pub fn observe_end(&self, elapsed: Duration) {
        self.state().end_duration.observe(elapsed);
    }

    pub fn record_run(&self, success: bool, at: DateTime<Utc>) {
        let mut state = self.state();
        if success {
            state.runs_success += 1;
        } else {
            state.runs_failure += 1;
        }
        state.last_run = Some(at);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state();
        MetricsSnapshot {
            source: self.source.to_string(),
            device: self.device.to_string(),
            news_total: state.news_total.values().sum(),
            runs_success: state.runs_success,
            runs_failure: state.runs_failure,
            last_run: state.last_run,
        }
    }

    pub fn render_prometheus(&self) -> Result<String, fmt::Error> {
        let state = self.state();
        let base = format!("type=\"{}\",source=\"{}\"", self.device, self.source);
        let mut out = String::new();
        write_exposition(&mut out, &state, &base)?;
        Ok(out)
    }
}

fn write_exposition(out: &mut String, state: &State, base: &str) -> fmt::Result {
    out.push_str("# HELP news_total Number of news collected.\n# TYPE news_total counter\n");
    for (location, count) in &state.news_total {
        writeln!(out, "news_total{{{base},location=\"{location}\"}} {count}")?;
    }

    out.push_str("# HELP news_end_status Status of news end call.\n# TYPE news_end_status counter\n");
    for (status, count) in &state.end_status {
        writeln!(out, "news_end_status{{{base},status=\"{status}\"}} {count}")?;
    }

    out.push_str(
        "# HELP news_list_duration_seconds Duration of news list call.\n# TYPE news_list_duration_seconds summary\n",
    );
    for (location, summary) in &state.list_duration {
        let labels = format!("{base},location=\"{location}\"");
        writeln!(out, "news_list_duration_seconds_sum{{{labels}}} {}", summary.sum)?;
        writeln!(out, "news_list_duration_seconds_count{{{labels}}} {}", summary.count)?;
    }

    out.push_str(
        "# HELP news_end_duration_seconds Duration of news end call.\n# TYPE news_end_duration_seconds summary\n",
    );
    writeln!(out, "news_end_duration_seconds_sum{{{base}}} {}", state.end_duration.sum)?;
    writeln!(out, "news_end_duration_seconds_count{{{base}}} {}", state.end_duration.count)?;

    out.push_str("# HELP collector_runs_total Finished collection runs.\n# TYPE collector_runs_total counter\n");
    writeln!(out, "collector_runs_total{{status=\"success\"}} {}", state.runs_success)?;
    writeln!(out, "collector_runs_total{{status=\"failure\"}} {}", state.runs_failure)?;

    if let Some(last_run) = state.last_run {
        out.push_str(
            "# HELP collector_last_run_timestamp_seconds Completion time of the last run.\n# TYPE collector_last_run_timestamp_seconds gauge\n",
        );
        writeln!(out, "collector_last_run_timestamp_seconds {}", last_run.timestamp())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renders_counters_and_summaries() {
        let metrics = CollectorMetrics::new(Source::Daum, DeviceType::Mobile);
        metrics.record_news(Location::Top, 12);
        metrics.record_news(Location::Home, 30);
        metrics.record_end_status("extracted");
        metrics.record_end_status("extracted");
        metrics.record_end_status("skipped");
        metrics.observe_list(Location::Top, Duration::from_millis(1500));
        metrics.observe_end(Duration::from_millis(250));
        let at = Utc.with_ymd_and_hms(2022, 11, 5, 11, 30, 0).single().expect("ts");
        metrics.record_run(true, at);

        let text = metrics.render_prometheus().expect("render");
        assert!(text.contains("news_total{type=\"mobile\",source=\"daum\",location=\"Top\"} 12"));
        assert!(text.contains("news_end_status{type=\"mobile\",source=\"daum\",status=\"extracted\"} 2"));
        assert!(text.contains("news_list_duration_seconds_sum{type=\"mobile\",source=\"daum\",location=\"Top\"} 1.5"));
        assert!(text.contains("news_end_duration_seconds_count{type=\"mobile\",source=\"daum\"} 1"));
        assert!(text.contains("collector_runs_total{status=\"success\"} 1"));
        assert!(text.contains(&format!("collector_last_run_timestamp_seconds {}", at.timestamp())));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.news_total, 42);
        assert_eq!(snapshot.runs_success, 1);
        assert_eq!(snapshot.last_run, Some(at));
    }

    #[test]
    fn last_run_gauge_is_absent_before_first_run() {
        let metrics = CollectorMetrics::new(Source::Daum, DeviceType::Pc);
        let text = metrics.render_prometheus().expect("render");
        assert!(!text.contains("collector_last_run_timestamp_seconds "));
        assert!(text.contains("collector_runs_total{status=\"failure\"} 0"));
    }
}
