use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::sqlite::{NewConversationSegment, VectorType};
use crate::indexer::{BatchReport, VectorizeOutcome};
use crate::search::SearchRequest;
use crate::service::VectorService;

async fn open_service() -> Result<VectorService> {
    let config = Config::load_default().context("Failed to load configuration")?;
    VectorService::new(config)
        .await
        .context("Failed to initialize vector service")
}

/// Token cancelled on Ctrl-C so long batches stop between entities
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            child.cancel();
        }
    });
    token
}

fn spinner(message: String) -> ProgressBar {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        )
    } else {
        ProgressBar::hidden()
    };
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_report(report: &BatchReport) {
    println!("  Vectorized: {}", style(report.succeeded).green());
    println!("  Skipped:    {}", report.skipped);
    if report.cancelled > 0 {
        println!("  Cancelled:  {}", style(report.cancelled).yellow());
    }
    if !report.flush_pending.is_empty() {
        println!(
            "  Not yet persisted: {} {:?}",
            style(report.flush_pending.len()).yellow(),
            report.flush_pending
        );
    }
    if !report.failed.is_empty() {
        println!("  Failed:     {}", style(report.failed.len()).red());
        for failure in &report.failed {
            println!("    entity {}: {}", failure.entity_id, failure.reason);
        }
    }
}

/// Reads segments from a JSON file holding one segment or an array of them
#[inline]
pub async fn read_segments(path: &Path) -> Result<Vec<NewConversationSegment>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    let segments = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|segment| vec![segment])
    }
    .with_context(|| format!("{} does not hold conversation segments", path.display()))?;

    Ok(segments)
}

/// Store segments from a JSON file, optionally vectorizing each one
#[inline]
pub async fn ingest_segments(path: &Path, vectorize: bool) -> Result<()> {
    let segments = read_segments(path).await?;
    let service = open_service().await?;
    let cancel = cancel_on_ctrl_c();

    println!("Ingesting {} segments from {}", segments.len(), path.display());

    for segment in &segments {
        let stored = service.ingest(segment).await?;
        print!(
            "  Segment {} (group {}, {} messages)",
            stored.id, stored.group_id, stored.message_count
        );

        if vectorize {
            match service.vectorizer().vectorize_segment(&stored, &cancel).await {
                Ok(VectorizeOutcome::Vectorized { position }) => {
                    print!(" {} at position {}", style("vectorized").green(), position);
                }
                Ok(VectorizeOutcome::Skipped) => print!(" already vectorized"),
                Err(e) => print!(" {}: {}", style("vectorization failed").red(), e),
            }
        }
        println!();
    }

    service.shutdown().await?;
    Ok(())
}

/// Vectorize everything pending in a group
#[inline]
pub async fn vectorize_group(group_id: i64, vector_type: VectorType) -> Result<()> {
    let service = open_service().await?;
    let cancel = cancel_on_ctrl_c();

    let bar = spinner(format!("Vectorizing group {group_id} ({vector_type})"));
    let result = service
        .vectorizer()
        .vectorize_group(group_id, vector_type, &cancel)
        .await;
    bar.finish_and_clear();

    let report = result.with_context(|| format!("Failed to vectorize group {group_id}"))?;
    println!("Group {} ({}):", group_id, vector_type);
    print_report(&report);
    service.shutdown().await?;
    Ok(())
}

/// Vectorize a single stored segment
#[inline]
pub async fn vectorize_segment(segment_id: i64) -> Result<()> {
    let service = open_service().await?;
    let cancel = cancel_on_ctrl_c();

    match service
        .vectorizer()
        .vectorize_segment_by_id(segment_id, &cancel)
        .await?
    {
        Some(VectorizeOutcome::Vectorized { position }) => {
            println!("Segment {} vectorized at position {}", segment_id, position);
        }
        Some(VectorizeOutcome::Skipped) => {
            println!("Segment {} was already vectorized", segment_id);
        }
        None => println!("Segment {} not found", segment_id),
    }
    service.shutdown().await?;
    Ok(())
}

/// Rebuild a group's index from its source entities
#[inline]
pub async fn rebuild_group(group_id: i64, vector_type: VectorType) -> Result<()> {
    let service = open_service().await?;
    let cancel = cancel_on_ctrl_c();

    let bar = spinner(format!("Rebuilding group {group_id} ({vector_type})"));
    let result = service
        .vectorizer()
        .rebuild_group(group_id, vector_type, &cancel)
        .await;
    bar.finish_and_clear();

    let report = result.with_context(|| format!("Failed to rebuild group {group_id}"))?;
    println!("Rebuilt group {} ({}):", group_id, vector_type);
    print_report(&report);
    Ok(())
}

/// Run a semantic search and print the page
#[inline]
pub async fn search(request: SearchRequest) -> Result<()> {
    let service = open_service().await?;
    let response = service.search(&request).await?;

    if response.count == 0 {
        println!("No results in group {}", request.group_id);
        return Ok(());
    }

    println!(
        "Results {}-{} of {} for {}",
        response.skip + 1,
        response.skip + response.hits.len(),
        response.count,
        style(&request.query).bold()
    );

    for (rank, hit) in response.hits.iter().enumerate() {
        println!();
        println!(
            "{}. {} {} (distance {:.4})",
            response.skip + rank + 1,
            request.vector_type,
            hit.entity_id,
            hit.distance
        );
        for message in &hit.messages {
            println!(
                "   [{}] {}: {}",
                message.date_time.format("%Y-%m-%d %H:%M"),
                message.from_user_id,
                message.content
            );
        }
    }

    Ok(())
}

/// Show registry state, vector totals and consistency
#[inline]
pub async fn show_status() -> Result<()> {
    let service = open_service().await?;

    println!("{}", style("📊 Index Status").bold().cyan());
    println!("{}", "=".repeat(50));

    let status = service.status().await?;
    println!("Index directory: {}", status.index_dir.display());
    for vector_type in VectorType::ALL {
        println!(
            "  {} indexes: {}",
            vector_type,
            status.files_of_type(vector_type)
        );
    }
    println!("  Total vectors: {}", status.total_vectors);
    println!(
        "  Size on disk: {:.2} MB",
        status.total_bytes as f64 / (1024.0 * 1024.0)
    );
    println!("  Artifact files: {}", status.artifacts_on_disk);

    println!();
    println!("{}", style("🔍 Consistency").bold().cyan());
    match service.validate_consistency().await {
        Ok(report) if report.is_consistent => {
            println!("   ✅ {}", report.summary());
        }
        Ok(report) => {
            println!("   ⚠️  {}", report.summary());
            for issue in &report.inconsistent_keys {
                println!("   - {}: {}", issue.key, issue.problem);
            }
        }
        Err(e) => println!("   ❌ Failed to check consistency: {}", e),
    }

    Ok(())
}

/// Show segment and entry statistics
#[inline]
pub async fn show_statistics() -> Result<()> {
    let service = open_service().await?;
    let statistics = service.statistics().await?;

    println!("{}", style("📈 Vectorization Statistics").bold().cyan());
    println!("  Segments: {}", statistics.total_segments);
    println!(
        "  Vectorized: {} ({:.1}%)",
        statistics.vectorized_segments,
        statistics.vectorized_percentage()
    );
    println!("  Pending: {}", statistics.pending_segments);

    if !statistics.entries_by_type.is_empty() {
        println!();
        println!("  Entries by type:");
        for count in &statistics.entries_by_type {
            println!("    {}: {}", count.vector_type, count.count);
        }
    }

    if !statistics.top_groups.is_empty() {
        println!();
        println!("  Top groups by segments:");
        for group in &statistics.top_groups {
            println!("    group {}: {}", group.group_id, group.segment_count);
        }
    }

    Ok(())
}

/// Check the embedding provider, metadata store and index directory
#[inline]
pub async fn check_health() -> Result<bool> {
    let service = open_service().await?;
    let report = service.health().await;

    println!("{}", style("🩺 Health").bold().cyan());
    let line = |name: &str, error: Option<&str>| match error {
        None => println!("   ✅ {name}"),
        Some(e) => println!("   ❌ {name}: {e}"),
    };
    line("Embedding provider", report.embedding_error.as_deref());
    line("Metadata store", report.database_error.as_deref());
    line("Index directory", report.index_dir_error.as_deref());

    Ok(report.is_healthy())
}

/// Compare registry, entries and artifacts and list every issue
#[inline]
pub async fn check_consistency() -> Result<bool> {
    let service = open_service().await?;
    let report = service.validate_consistency().await?;

    println!("{}", report.summary());
    for issue in &report.inconsistent_keys {
        println!(
            "  {}: {} (registry {:?}, entries {}, artifact {:?}, max position {:?})",
            issue.key,
            issue.problem,
            issue.registry_count,
            issue.entry_count,
            issue.artifact_count,
            issue.max_position
        );
    }
    if !report.flagged_without_entry.is_empty() {
        println!(
            "  Segments flagged without entries: {:?}",
            report.flagged_without_entry
        );
    }
    for file in &report.unreferenced_files {
        println!("  Unreferenced file: {}", file);
    }

    Ok(report.is_consistent)
}

/// Remove stale registry rows, orphaned entries and unreferenced files
#[inline]
pub async fn cleanup(optimize: bool) -> Result<()> {
    let service = open_service().await?;
    let report = service.cleanup().await?;

    println!("Removed {} invalid index rows", report.invalid_rows_deleted);
    println!(
        "Removed {} orphaned entries",
        report.orphaned_entries_deleted
    );
    println!("Removed {} unreferenced files", report.files_deleted);

    if optimize {
        info!("Optimizing metadata store");
        service.optimize().await?;
        println!("Metadata store optimized");
    }

    Ok(())
}
