//! Tests for the metrics analyzer

use std::collections::BTreeMap;

use crate::aggregator::{CanonicalSummary, Percentiles, RunManifest, SeriesStats};
use crate::plan::TestKind;

use super::{AnalyzerContext, Category, Grade, MetricsAnalyzer, Severity};

fn stats(count: u64, mean: f64, sum: f64, p75: f64, p95: f64) -> SeriesStats {
    SeriesStats {
        count,
        sum,
        min: 0.0,
        max: mean * 2.0,
        mean,
        percentiles: Percentiles {
            p50: mean,
            p75,
            p90: p95,
            p95,
            p99: p95,
        },
        samples_preserved: count.min(10_000),
    }
}

fn summary_with(
    metrics: &[(&str, SeriesStats)],
    successful_workers: u32,
    worker_count: u32,
) -> CanonicalSummary {
    let metrics: BTreeMap<String, SeriesStats> = metrics
        .iter()
        .map(|(name, s)| (name.to_string(), s.clone()))
        .collect();
    CanonicalSummary {
        run_id: "run-analyzer".to_string(),
        metrics,
        manifest: RunManifest {
            run_id: "run-analyzer".to_string(),
            workers: Vec::new(),
            partial: successful_workers < worker_count,
            successful_workers,
            worker_count,
        },
    }
}

fn protocol_ctx() -> AnalyzerContext {
    AnalyzerContext {
        test_kind: TestKind::Protocol,
        target_url: "https://example.com".to_string(),
        duration_s: 60.0,
        total_vus: 10,
        cancelled: false,
        deadline_exceeded: false,
    }
}

fn browser_ctx() -> AnalyzerContext {
    AnalyzerContext {
        test_kind: TestKind::Browser,
        ..protocol_ctx()
    }
}

#[test]
fn test_clean_protocol_run_grades_a() {
    let summary = summary_with(
        &[
            ("http_req_duration", stats(600, 250.0, 150_000.0, 320.0, 385.0)),
            ("http_req_failed", stats(600, 0.0, 0.0, 0.0, 0.0)),
            ("http_reqs", stats(600, 1.0, 600.0, 1.0, 1.0)),
        ],
        2,
        2,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 100);
    assert_eq!(report.grade, Grade::A);
    assert!(report.findings.is_empty());
    assert!(!report
        .findings
        .iter()
        .any(|f| f.category == Category::ServerProcessing));
}

#[test]
fn test_slow_p95_deducts_twenty() {
    let summary = summary_with(
        &[("http_req_duration", stats(100, 900.0, 90_000.0, 1800.0, 2500.0))],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 80);
    assert_eq!(report.grade, Grade::B);
    let finding = &report.findings[0];
    assert_eq!(finding.category, Category::Latency);
    assert_eq!(finding.severity, Severity::High);
    assert_eq!(finding.supporting_metrics[0].value, 2500.0);
}

#[test]
fn test_very_slow_p95_deducts_thirty_five() {
    let summary = summary_with(
        &[("http_req_duration", stats(100, 2000.0, 200_000.0, 4000.0, 6000.0))],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 65);
    assert_eq!(report.grade, Grade::D);
}

#[test]
fn test_error_rate_bands() {
    for (rate, expected_score, expected_severity) in [
        (0.02, 90, Severity::Medium),
        (0.06, 75, Severity::High),
        (0.20, 60, Severity::High),
    ] {
        let summary = summary_with(
            &[("http_req_failed", stats(1000, rate, rate * 1000.0, 1.0, 1.0))],
            1,
            1,
        );
        let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
        assert_eq!(report.score, expected_score, "rate {rate}");
        let finding = &report.findings[0];
        assert_eq!(finding.category, Category::ErrorRate);
        assert_eq!(finding.severity, expected_severity, "rate {rate}");
    }
}

#[test]
fn test_low_throughput_needs_enough_vus() {
    // 300 requests over 60s is 5 rps.
    let metrics = [("http_reqs", stats(300, 1.0, 300.0, 1.0, 1.0))];

    let few_vus = MetricsAnalyzer::analyze(&summary_with(&metrics, 1, 1), &protocol_ctx());
    assert_eq!(few_vus.score, 100);

    let ctx = AnalyzerContext {
        total_vus: 25,
        ..protocol_ctx()
    };
    let many_vus = MetricsAnalyzer::analyze(&summary_with(&metrics, 1, 1), &ctx);
    assert_eq!(many_vus.score, 85);
    assert_eq!(many_vus.findings[0].category, Category::Throughput);
}

#[test]
fn test_server_think_time_deduction() {
    let summary = summary_with(
        &[("http_req_waiting", stats(500, 450.0, 225_000.0, 600.0, 700.0))],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 90);
    assert_eq!(report.findings[0].category, Category::ServerProcessing);
    assert_eq!(report.findings[0].severity, Severity::Medium);
}

#[test]
fn test_large_payload_deduction() {
    // 100 requests, 30 MiB received: 307 KiB per request.
    let summary = summary_with(
        &[
            ("http_reqs", stats(100, 1.0, 100.0, 1.0, 1.0)),
            (
                "data_received",
                stats(100, 314_572.8, 31_457_280.0, 0.0, 0.0),
            ),
        ],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 95);
    assert_eq!(report.findings[0].category, Category::PayloadSize);
    assert_eq!(report.findings[0].severity, Severity::Low);
    assert_eq!(
        report.resource_breakdown.bytes_per_request,
        Some(314_572.8)
    );
}

#[test]
fn test_browser_core_web_vitals_bands() {
    let summary = summary_with(
        &[
            (
                "largest_contentful_paint",
                stats(50, 2800.0, 140_000.0, 3000.0, 3500.0),
            ),
            (
                "cumulative_layout_shift",
                stats(50, 0.3, 15.0, 0.3, 0.4),
            ),
            ("first_input_delay", stats(50, 120.0, 6_000.0, 150.0, 200.0)),
        ],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &browser_ctx());
    // 100 - 20 (LCP) - 20 (CLS) - 10 (FID)
    assert_eq!(report.score, 50);
    assert_eq!(report.grade, Grade::F);
    assert_eq!(report.findings.len(), 3);
    assert!(report
        .findings
        .iter()
        .all(|f| f.category == Category::CoreWebVitals));
}

#[test]
fn test_browser_thresholds_do_not_apply_to_protocol() {
    let summary = summary_with(
        &[(
            "largest_contentful_paint",
            stats(50, 5000.0, 250_000.0, 5000.0, 5000.0),
        )],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 100);
}

#[test]
fn test_empty_summary_is_grade_f_with_no_samples_finding() {
    let summary = summary_with(&[], 1, 1);
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.score, 0);
    assert_eq!(report.grade, Grade::F);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, Category::NoSamples);
}

#[test]
fn test_all_workers_failed_finding() {
    let summary = summary_with(&[], 0, 3);
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    assert_eq!(report.grade, Grade::F);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, Category::NoSuccessfulWorkers);
}

#[test]
fn test_worker_dropout_finding() {
    let summary = summary_with(
        &[("http_req_duration", stats(300, 200.0, 60_000.0, 300.0, 350.0))],
        2,
        3,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    // Dropout is reported but not scored.
    assert_eq!(report.score, 100);
    let dropout = report
        .findings
        .iter()
        .find(|f| f.category == Category::WorkerDropout)
        .expect("dropout finding");
    assert_eq!(dropout.severity, Severity::Medium);
}

#[test]
fn test_cancelled_run_reports_only_cancellation() {
    let summary = summary_with(&[], 0, 3);
    let ctx = AnalyzerContext {
        cancelled: true,
        ..protocol_ctx()
    };
    let report = MetricsAnalyzer::analyze(&summary, &ctx);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, Category::Cancelled);
}

#[test]
fn test_deadline_exceeded_reports_diagnostic() {
    let summary = summary_with(&[], 0, 2);
    let ctx = AnalyzerContext {
        deadline_exceeded: true,
        ..protocol_ctx()
    };
    let report = MetricsAnalyzer::analyze(&summary, &ctx);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].category, Category::DeadlineExceeded);
    assert_eq!(report.findings[0].severity, Severity::High);
}

#[test]
fn test_findings_sorted_by_severity_then_category() {
    let summary = summary_with(
        &[
            ("http_req_duration", stats(100, 2000.0, 200_000.0, 4000.0, 6000.0)),
            ("http_req_failed", stats(100, 0.02, 2.0, 1.0, 1.0)),
            ("http_req_waiting", stats(100, 450.0, 45_000.0, 500.0, 600.0)),
            ("http_reqs", stats(100, 1.0, 100.0, 1.0, 1.0)),
            (
                "data_received",
                stats(100, 314_572.8, 31_457_280.0, 0.0, 0.0),
            ),
        ],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());

    let severities: Vec<Severity> = report.findings.iter().map(|f| f.severity).collect();
    let mut sorted = severities.clone();
    sorted.sort();
    assert_eq!(severities, sorted);

    // Within a severity bucket, category tags ascend.
    for pair in report.findings.windows(2) {
        if pair[0].severity == pair[1].severity {
            assert!(pair[0].category.as_str() <= pair[1].category.as_str());
        }
    }
}

#[test]
fn test_timings_breakdown_uses_phase_means() {
    let summary = summary_with(
        &[
            ("http_req_blocked", stats(100, 12.0, 1_200.0, 15.0, 20.0)),
            ("http_req_tls_handshaking", stats(100, 80.0, 8_000.0, 90.0, 95.0)),
            ("http_req_waiting", stats(100, 210.0, 21_000.0, 250.0, 300.0)),
        ],
        1,
        1,
    );
    let report = MetricsAnalyzer::analyze(&summary, &protocol_ctx());
    let breakdown = &report.timings_breakdown;
    assert_eq!(breakdown.dns_and_connection_pool_ms, Some(12.0));
    assert_eq!(breakdown.tls_handshake_ms, Some(80.0));
    assert_eq!(breakdown.server_processing_ms, Some(210.0));
    assert_eq!(breakdown.tcp_connect_ms, None);
}

#[test]
fn test_analysis_is_byte_identical_across_runs() {
    let summary = summary_with(
        &[
            ("http_req_duration", stats(500, 800.0, 400_000.0, 1500.0, 2500.0)),
            ("http_req_failed", stats(500, 0.03, 15.0, 1.0, 1.0)),
        ],
        2,
        3,
    );
    let ctx = protocol_ctx();
    let first = serde_json::to_vec(&MetricsAnalyzer::analyze(&summary, &ctx)).expect("encode");
    let second = serde_json::to_vec(&MetricsAnalyzer::analyze(&summary, &ctx)).expect("encode");
    assert_eq!(first, second);
}
