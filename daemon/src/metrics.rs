use anyhow::{Context, Result};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Durations kept per job for the percentile gauges.
const DURATION_WINDOW: usize = 100;

/// Per-worker render counters in Prometheus text format.
pub struct MetricsCollector {
    task_claims: Arc<DashMap<String, AtomicU64>>,
    task_completions: Arc<DashMap<String, AtomicU64>>,
    task_failures: Arc<DashMap<String, AtomicU64>>,
    task_interruptions: Arc<DashMap<String, AtomicU64>>,
    task_durations: Arc<DashMap<String, Vec<u64>>>,
    polls: Arc<AtomicU64>,
    contentions: Arc<AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            task_claims: Arc::new(DashMap::new()),
            task_completions: Arc::new(DashMap::new()),
            task_failures: Arc::new(DashMap::new()),
            task_interruptions: Arc::new(DashMap::new()),
            task_durations: Arc::new(DashMap::new()),
            polls: Arc::new(AtomicU64::new(0)),
            contentions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Another worker claimed the offered task first.
    pub fn record_contention(&self) {
        self.contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim(&self, job_id: &str) {
        bump(&self.task_claims, job_id);
    }

    pub fn record_completion(&self, job_id: &str, duration_ms: u64) {
        bump(&self.task_completions, job_id);

        let mut entry = self.task_durations.entry(job_id.to_string()).or_default();
        entry.push(duration_ms);
        let len = entry.len();
        if len > DURATION_WINDOW {
            entry.drain(0..len - DURATION_WINDOW);
        }
    }

    pub fn record_failure(&self, job_id: &str) {
        bump(&self.task_failures, job_id);
    }

    pub fn record_interruption(&self, job_id: &str) {
        bump(&self.task_interruptions, job_id);
    }

    /// Forget per-job series for jobs that `keep` rejects.
    pub fn retain_jobs(&self, keep: impl Fn(&str) -> bool) {
        for map in [&self.task_claims, &self.task_completions, &self.task_failures, &self.task_interruptions] {
            map.retain(|job_id, _| keep(job_id));
        }
        self.task_durations.retain(|job_id, _| keep(job_id));
    }

    #[cfg(test)]
    pub fn claims(&self, job_id: &str) -> u64 {
        read(&self.task_claims, job_id)
    }

    #[cfg(test)]
    pub fn completions(&self, job_id: &str) -> u64 {
        read(&self.task_completions, job_id)
    }

    #[cfg(test)]
    pub fn failures(&self, job_id: &str) -> u64 {
        read(&self.task_failures, job_id)
    }

    #[cfg(test)]
    pub fn interruptions(&self, job_id: &str) -> u64 {
        read(&self.task_interruptions, job_id)
    }

    pub fn contentions(&self) -> u64 {
        self.contentions.load(Ordering::Relaxed)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP renderqueue_polls_total Times this worker looked for work\n");
        output.push_str("# TYPE renderqueue_polls_total counter\n");
        output.push_str(&format!("renderqueue_polls_total {}\n\n", self.polls.load(Ordering::Relaxed)));

        output.push_str("# HELP renderqueue_claim_contentions_total Claims lost to another worker\n");
        output.push_str("# TYPE renderqueue_claim_contentions_total counter\n");
        output.push_str(&format!("renderqueue_claim_contentions_total {}\n\n", self.contentions()));

        export_counter(&mut output, "renderqueue_task_claims_total", "Tasks claimed", &self.task_claims);
        export_counter(&mut output, "renderqueue_task_completions_total", "Tasks rendered successfully", &self.task_completions);
        export_counter(&mut output, "renderqueue_task_failures_total", "Tasks that failed to render", &self.task_failures);
        export_counter(&mut output, "renderqueue_task_interruptions_total", "Tasks interrupted and requeued", &self.task_interruptions);

        output.push_str("# HELP renderqueue_task_duration_ms Task render duration percentiles\n");
        output.push_str("# TYPE renderqueue_task_duration_ms gauge\n");
        for entry in self.task_durations.iter() {
            let mut durations = entry.value().clone();
            if durations.is_empty() {
                continue;
            }
            durations.sort_unstable();
            for (label, p) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                output.push_str(&format!(
                    "renderqueue_task_duration_ms{{job_id=\"{}\",quantile=\"{}\"}} {}\n",
                    entry.key(),
                    label,
                    percentile(&durations, p)
                ));
            }
        }

        output
    }

    /// Replace `path` with the current export.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, self.export())
            .with_context(|| format!("Failed to write metrics to {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace metrics file {:?}", path))
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counters: &DashMap<String, AtomicU64>, job_id: &str) {
    counters
        .entry(job_id.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
fn read(counters: &DashMap<String, AtomicU64>, job_id: &str) -> u64 {
    counters.get(job_id).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
}

fn export_counter(output: &mut String, name: &str, help: &str, counters: &DashMap<String, AtomicU64>) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    for entry in counters.iter() {
        output.push_str(&format!(
            "{}{{job_id=\"{}\"}} {}\n",
            name,
            entry.key(),
            entry.value().load(Ordering::Relaxed)
        ));
    }
    output.push('\n');
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let index = ((p / 100.0) * (sorted_data.len() as f64 - 1.0)).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}
