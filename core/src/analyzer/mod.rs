//! Performance grading and findings
//!
//! The analyzer is a pure function from a canonical summary (plus a small
//! amount of run context) to a graded report. Running it twice on the
//! same inputs yields byte-identical output.

mod findings;

pub use findings::{Category, Finding, Severity, SupportingMetric};

use serde::{Deserialize, Serialize};

use crate::aggregator::CanonicalSummary;
use crate::plan::TestKind;

const KIB: f64 = 1024.0;

/// Letter grade bands over the 0..=100 score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    /// 90 and above
    A,
    /// 80..=89
    B,
    /// 70..=79
    C,
    /// 60..=69
    D,
    /// Below 60
    F,
}

impl Grade {
    /// Band for a score
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Grade::A,
            80..=89 => Grade::B,
            70..=79 => Grade::C,
            60..=69 => Grade::D,
            _ => Grade::F,
        }
    }
}

/// Facts about the run that the summary alone does not carry
#[derive(Debug, Clone)]
pub struct AnalyzerContext {
    /// Kind of test the workers ran
    pub test_kind: TestKind,
    /// Target the workers hit
    pub target_url: String,
    /// Planned test duration, seconds
    pub duration_s: f64,
    /// Total virtual users across the fleet
    pub total_vus: u32,
    /// The run was cancelled before completion
    pub cancelled: bool,
    /// The run was stopped at its hard deadline
    pub deadline_exceeded: bool,
}

/// Mean time attributed to each request phase, milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingsBreakdown {
    /// Connection acquisition including DNS (`http_req_blocked`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_and_connection_pool_ms: Option<f64>,
    /// TCP connect (`http_req_connecting`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_connect_ms: Option<f64>,
    /// TLS negotiation (`http_req_tls_handshaking`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_handshake_ms: Option<f64>,
    /// Request bytes on the wire (`http_req_sending`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_send_ms: Option<f64>,
    /// Server think time (`http_req_waiting`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_processing_ms: Option<f64>,
    /// Response body read (`http_req_receiving`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_receive_ms: Option<f64>,
}

/// Data volume view of the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBreakdown {
    /// Total bytes sent by all workers
    pub data_sent_bytes: f64,
    /// Total bytes received by all workers
    pub data_received_bytes: f64,
    /// Received bytes per delivered request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_request: Option<f64>,
}

/// Graded view of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Letter grade
    pub grade: Grade,
    /// Score in 0..=100
    pub score: u32,
    /// The canonical summary the grade was computed from
    pub summary: CanonicalSummary,
    /// Findings, highest severity first, then by category tag
    pub findings: Vec<Finding>,
    /// Per-phase timing attribution
    pub timings_breakdown: TimingsBreakdown,
    /// Data volume breakdown
    pub resource_breakdown: ResourceBreakdown,
}

/// Turns a canonical summary into a graded report
pub struct MetricsAnalyzer;

impl MetricsAnalyzer {
    /// Analyze a summary; deterministic for a given input
    pub fn analyze(summary: &CanonicalSummary, ctx: &AnalyzerContext) -> PerformanceReport {
        let mut score: i64 = 100;
        let mut findings = Vec::new();
        let has_samples = summary.total_samples() > 0;

        if !has_samples {
            score = 0;
        }

        if ctx.cancelled || ctx.deadline_exceeded {
            // A stopped run explains why it stopped and nothing else.
            if ctx.deadline_exceeded {
                findings.push(Finding::new(
                    Severity::High,
                    Category::DeadlineExceeded,
                    "Run was stopped at its hard deadline",
                    format!(
                        "The run overshot four times its planned {:.0}s duration and was cancelled",
                        ctx.duration_s
                    ),
                ));
            } else {
                findings.push(Finding::new(
                    Severity::Medium,
                    Category::Cancelled,
                    "Run cancelled before completion",
                    "A cancellation signal stopped the run; results below cover only the portion that ran",
                ));
            }
        } else if !has_samples {
            if summary.manifest.worker_count > 0 && summary.manifest.successful_workers == 0 {
                findings.push(
                    Finding::new(
                        Severity::High,
                        Category::NoSuccessfulWorkers,
                        "No worker completed",
                        format!(
                            "All {} workers ended without producing results",
                            summary.manifest.worker_count
                        ),
                    )
                    .with_metric("workers", "successful", 0.0),
                );
            } else {
                findings.push(Finding::new(
                    Severity::High,
                    Category::NoSamples,
                    "The run produced no samples",
                    "No timing samples were collected from any worker",
                ));
            }
        } else {
            match ctx.test_kind {
                TestKind::Protocol => protocol_deductions(summary, ctx, &mut score, &mut findings),
                TestKind::Browser => browser_deductions(summary, &mut score, &mut findings),
            }

            if summary.manifest.partial && summary.manifest.successful_workers > 0 {
                let missing =
                    summary.manifest.worker_count - summary.manifest.successful_workers;
                findings.push(
                    Finding::new(
                        Severity::Medium,
                        Category::WorkerDropout,
                        "Part of the worker fleet dropped out",
                        format!(
                            "{missing} of {} workers contributed no results; the grade covers the remainder",
                            summary.manifest.worker_count
                        ),
                    )
                    .with_metric(
                        "workers",
                        "successful",
                        summary.manifest.successful_workers as f64,
                    ),
                );
            }
        }

        let score = score.clamp(0, 100) as u32;
        findings.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.category.as_str().cmp(b.category.as_str()))
        });

        PerformanceReport {
            grade: Grade::from_score(score),
            score,
            summary: summary.clone(),
            findings,
            timings_breakdown: timings_breakdown(summary),
            resource_breakdown: resource_breakdown(summary),
        }
    }
}

/// Apply a deduction and record the finding that explains it
fn deduct(
    score: &mut i64,
    findings: &mut Vec<Finding>,
    amount: u32,
    category: Category,
    title: impl Into<String>,
    detail: impl Into<String>,
    metric: &str,
    statistic: &str,
    value: f64,
) {
    *score -= amount as i64;
    findings.push(
        Finding::new(Severity::for_deduction(amount), category, title, detail)
            .with_metric(metric, statistic, value),
    );
}

fn protocol_deductions(
    summary: &CanonicalSummary,
    ctx: &AnalyzerContext,
    score: &mut i64,
    findings: &mut Vec<Finding>,
) {
    if let Some(stats) = summary.metric("http_req_duration") {
        let p95 = stats.percentiles.p95;
        if p95 > 5000.0 {
            deduct(
                score,
                findings,
                35,
                Category::Latency,
                "Very slow end-to-end request times",
                format!("p95 request duration is {p95:.0} ms"),
                "http_req_duration",
                "p95",
                p95,
            );
        } else if p95 > 2000.0 {
            deduct(
                score,
                findings,
                20,
                Category::Latency,
                "Slow end-to-end request times",
                format!("p95 request duration is {p95:.0} ms"),
                "http_req_duration",
                "p95",
                p95,
            );
        }
    }

    if let Some(stats) = summary.metric("http_req_failed") {
        let rate = stats.mean;
        let (amount, label) = if rate > 0.10 {
            (40, "Severe request failure rate")
        } else if rate > 0.05 {
            (25, "High request failure rate")
        } else if rate > 0.01 {
            (10, "Elevated request failure rate")
        } else {
            (0, "")
        };
        if amount > 0 {
            deduct(
                score,
                findings,
                amount,
                Category::ErrorRate,
                label,
                format!("{:.1}% of requests failed", rate * 100.0),
                "http_req_failed",
                "mean",
                rate,
            );
        }
    }

    if let Some(reqs) = summary.metric("http_reqs") {
        if ctx.duration_s > 0.0 {
            let rps = reqs.count as f64 / ctx.duration_s;
            if rps < 10.0 && ctx.total_vus >= 25 {
                deduct(
                    score,
                    findings,
                    15,
                    Category::Throughput,
                    "Low delivered throughput",
                    format!(
                        "{rps:.1} requests/s delivered by {} virtual users",
                        ctx.total_vus
                    ),
                    "http_reqs",
                    "rate",
                    rps,
                );
            }
        }
    }

    if let Some(waiting) = summary.metric("http_req_waiting") {
        if waiting.mean > 400.0 {
            deduct(
                score,
                findings,
                10,
                Category::ServerProcessing,
                "Server processing dominates request time",
                format!("mean time to first byte is {:.0} ms", waiting.mean),
                "http_req_waiting",
                "mean",
                waiting.mean,
            );
        }
    }

    if let (Some(received), Some(reqs)) =
        (summary.metric("data_received"), summary.metric("http_reqs"))
    {
        if reqs.count > 0 {
            let per_request = received.sum / reqs.count as f64;
            if per_request > 200.0 * KIB {
                deduct(
                    score,
                    findings,
                    5,
                    Category::PayloadSize,
                    "Large response payloads",
                    format!("{:.0} KiB received per request", per_request / KIB),
                    "data_received",
                    "bytes_per_request",
                    per_request,
                );
            }
        }
    }
}

fn browser_deductions(summary: &CanonicalSummary, score: &mut i64, findings: &mut Vec<Finding>) {
    if let Some(lcp) = summary.metric("largest_contentful_paint") {
        let p75 = lcp.percentiles.p75;
        let amount = if p75 > 4000.0 {
            35
        } else if p75 > 2500.0 {
            20
        } else {
            0
        };
        if amount > 0 {
            deduct(
                score,
                findings,
                amount,
                Category::CoreWebVitals,
                "Slow largest contentful paint",
                format!("p75 LCP is {p75:.0} ms"),
                "largest_contentful_paint",
                "p75",
                p75,
            );
        }
    }

    if let Some(cls) = summary.metric("cumulative_layout_shift") {
        let p75 = cls.percentiles.p75;
        let amount = if p75 > 0.25 {
            20
        } else if p75 > 0.1 {
            10
        } else {
            0
        };
        if amount > 0 {
            deduct(
                score,
                findings,
                amount,
                Category::CoreWebVitals,
                "Layout shifts during load",
                format!("p75 cumulative layout shift is {p75:.2}"),
                "cumulative_layout_shift",
                "p75",
                p75,
            );
        }
    }

    if let Some(fid) = summary.metric("first_input_delay") {
        let p75 = fid.percentiles.p75;
        let amount = if p75 > 300.0 {
            20
        } else if p75 > 100.0 {
            10
        } else {
            0
        };
        if amount > 0 {
            deduct(
                score,
                findings,
                amount,
                Category::CoreWebVitals,
                "Slow response to first input",
                format!("p75 first input delay is {p75:.0} ms"),
                "first_input_delay",
                "p75",
                p75,
            );
        }
    }
}

fn timings_breakdown(summary: &CanonicalSummary) -> TimingsBreakdown {
    let mean = |name: &str| summary.metric(name).filter(|s| s.count > 0).map(|s| s.mean);
    TimingsBreakdown {
        dns_and_connection_pool_ms: mean("http_req_blocked"),
        tcp_connect_ms: mean("http_req_connecting"),
        tls_handshake_ms: mean("http_req_tls_handshaking"),
        request_send_ms: mean("http_req_sending"),
        server_processing_ms: mean("http_req_waiting"),
        response_receive_ms: mean("http_req_receiving"),
    }
}

fn resource_breakdown(summary: &CanonicalSummary) -> ResourceBreakdown {
    let sum = |name: &str| summary.metric(name).map(|s| s.sum).unwrap_or(0.0);
    let bytes_per_request = summary
        .metric("http_reqs")
        .filter(|reqs| reqs.count > 0)
        .and_then(|reqs| {
            summary
                .metric("data_received")
                .map(|received| received.sum / reqs.count as f64)
        });
    ResourceBreakdown {
        data_sent_bytes: sum("data_sent"),
        data_received_bytes: sum("data_received"),
        bytes_per_request,
    }
}

#[cfg(test)]
mod tests;
