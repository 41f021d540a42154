//! Knowledge-base and serving statistics.
//!
//! Provides a quick summary of what's indexed and how serving is doing:
//! document counts, chunk counts, embedding coverage, per-source-type
//! breakdowns, cache hit rate, and average latency. Used by `aero stats`
//! and `GET /stats` — the numbers behind the admin dashboards.

use anyhow::Result;
use serde::Serialize;

use crate::pipeline::ServingMetrics;
use crate::store::{DocumentStore, SourceTypeStats};

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
    pub by_source_type: Vec<SourceTypeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving: Option<ServingMetrics>,
}

/// Collect knowledge-base stats, optionally together with serving metrics
/// from a running pipeline.
pub async fn collect_stats(
    store: &DocumentStore,
    serving: Option<ServingMetrics>,
) -> Result<StatsReport> {
    Ok(StatsReport {
        documents: store.count_documents().await?,
        chunks: store.count_chunks().await?,
        embedded_chunks: store.count_embedded_chunks().await?,
        by_source_type: store.source_type_stats().await?,
        serving,
    })
}

/// Print a stats report in the CLI format.
pub fn print_stats(report: &StatsReport) {
    println!("Aero — Knowledge Base Stats");
    println!("===========================");
    println!();
    println!("  Documents:   {}", report.documents);
    println!("  Chunks:      {}", report.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        report.embedded_chunks,
        report.chunks,
        if report.chunks > 0 {
            (report.embedded_chunks * 100) / report.chunks
        } else {
            0
        }
    );

    if !report.by_source_type.is_empty() {
        println!();
        println!("  By source type:");
        println!(
            "  {:<12} {:>6} {:>8} {:>12}",
            "TYPE", "DOCS", "CHUNKS", "TEXT"
        );
        println!("  {}", "-".repeat(42));
        for s in &report.by_source_type {
            println!(
                "  {:<12} {:>6} {:>8} {:>12}",
                s.source_type,
                s.documents,
                s.chunks,
                format_bytes(s.text_bytes.max(0) as u64)
            );
        }
    }

    if let Some(serving) = &report.serving {
        println!();
        println!("  Serving:");
        println!("    queries:              {}", serving.queries);
        println!(
            "    cache hit rate:       {:.1}%",
            serving.cache_hit_rate * 100.0
        );
        println!("    avg latency:          {} ms", serving.avg_latency_ms);
        println!("    failures:             {}", serving.failures);
        println!(
            "    insufficient context: {}",
            serving.insufficient_context
        );
    }

    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
