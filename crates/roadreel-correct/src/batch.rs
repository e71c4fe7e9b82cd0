//! Batch correction runs and their on-disk reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parquet::arrow::ArrowWriter;
use roadreel_core::{CorrectionMethod, CorrectionOutcome, FailureCategory, StoryRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::corrector::Corrector;

pub const BRIEF_FILE: &str = "correction_brief.md";
pub const OUTCOMES_FILE: &str = "outcomes.json";
pub const OUTCOMES_SNAPSHOT: &str = "snapshots/outcomes.parquet";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_attempted: usize,
    pub successful_corrections: usize,
    pub tier1_success: usize,
    pub tier2_success: usize,
    pub failures: usize,
    pub failure_categories: BTreeMap<FailureCategory, usize>,
    pub outcomes: Vec<CorrectionOutcome>,
}

impl BatchSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempted == 0 {
            0.0
        } else {
            self.successful_corrections as f64 / self.total_attempted as f64 * 100.0
        }
    }
}

/// Fold outcomes into batch counts. Outcome order is preserved.
pub fn summarize(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcomes: Vec<CorrectionOutcome>,
) -> BatchSummary {
    let mut summary = BatchSummary {
        run_id,
        started_at,
        finished_at,
        total_attempted: outcomes.len(),
        successful_corrections: 0,
        tier1_success: 0,
        tier2_success: 0,
        failures: 0,
        failure_categories: BTreeMap::new(),
        outcomes: Vec::new(),
    };
    for outcome in &outcomes {
        match (outcome.method_used(), outcome.failure_category()) {
            (Some(method), _) => {
                summary.successful_corrections += 1;
                match method {
                    CorrectionMethod::PreciseSearch => summary.tier1_success += 1,
                    CorrectionMethod::BroadenedSearch => summary.tier2_success += 1,
                }
            }
            (None, category) => {
                summary.failures += 1;
                *summary
                    .failure_categories
                    .entry(category.unwrap_or(FailureCategory::UnknownError))
                    .or_default() += 1;
            }
        }
    }
    summary.outcomes = outcomes;
    summary
}

impl Corrector {
    /// Correct every story, at most `concurrency` at a time. Outcomes come back in input order.
    pub async fn correct_batch(&self, stories: &[StoryRecord], concurrency: usize) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let started_at = self.now();
        info!(%run_id, stories = stories.len(), concurrency, "starting batch correction");

        let outcomes = stream::iter(stories)
            .map(|story| self.correct(story))
            .buffered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let summary = summarize(run_id, started_at, self.now(), outcomes);
        info!(
            %run_id,
            corrected = summary.successful_corrections,
            failed = summary.failures,
            "batch correction finished"
        );
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn render_brief(summary: &BatchSummary) -> String {
    let categories = if summary.failure_categories.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failure_categories
            .iter()
            .map(|(category, count)| format!("- {category}: {count} ({})", category.description()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let failed = summary
        .outcomes
        .iter()
        .filter(|o| !o.is_success())
        .map(|o| {
            format!(
                "- story {}: {} ({})",
                o.story_id,
                o.failure_category().unwrap_or(FailureCategory::UnknownError),
                o.failure_reasons.join("; ")
            )
        })
        .collect::<Vec<_>>();
    format!(
        "# Locator Correction Brief\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Attempted: {}\n\
         - Corrected: {} (tier1: {}, tier2: {})\n\
         - Failed: {}\n\
         - Success rate: {:.1}%\n\n\
         ## Failure Categories\n{}\n\n\
         ## Failed Stories\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.total_attempted,
        summary.successful_corrections,
        summary.tier1_success,
        summary.tier2_success,
        summary.failures,
        summary.success_rate(),
        categories,
        if failed.is_empty() { "- none".to_string() } else { failed.join("\n") },
    )
}

/// Write `reports/<run_id>/` with the markdown brief, the JSON outcomes and a
/// parquet snapshot plus its manifest. Returns the run directory.
pub async fn write_batch_report(reports_root: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing batch summary")?;
    fs::write(run_dir.join(OUTCOMES_FILE), json)
        .await
        .with_context(|| format!("writing {OUTCOMES_FILE}"))?;

    let snapshot_path = run_dir.join(OUTCOMES_SNAPSHOT);
    if let Some(snapshot_dir) = snapshot_path.parent() {
        fs::create_dir_all(snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    }
    let parquet = encode_outcomes_parquet(&summary.outcomes)?;
    fs::write(&snapshot_path, &parquet)
        .await
        .with_context(|| format!("writing {}", snapshot_path.display()))?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![ParquetManifestFile {
            name: "outcomes".to_string(),
            path: OUTCOMES_SNAPSHOT.to_string(),
            sha256: hex::encode(Sha256::digest(&parquet)),
            bytes: parquet.len() as u64,
        }],
    };
    let manifest_path = run_dir.join("snapshots").join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(run_dir = %run_dir.display(), "batch report written");
    Ok(run_dir)
}

/// One row per outcome, encoded in memory so the manifest hashes exactly what lands on disk.
fn encode_outcomes_parquet(outcomes: &[CorrectionOutcome]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("story_id", DataType::UInt64, false),
        ArrowField::new("success", DataType::Boolean, false),
        ArrowField::new("method_used", DataType::Utf8, true),
        ArrowField::new("confidence", DataType::Float64, true),
        ArrowField::new("corrected_url", DataType::Utf8, true),
        ArrowField::new("video_url", DataType::Utf8, true),
        ArrowField::new("failure_category", DataType::Utf8, true),
        ArrowField::new("methods_attempted", DataType::UInt32, false),
        ArrowField::new("attempted_at", DataType::Utf8, false),
    ]));

    let story_ids = UInt64Array::from(outcomes.iter().map(|o| o.story_id).collect::<Vec<_>>());
    let successes = BooleanArray::from(outcomes.iter().map(|o| o.is_success()).collect::<Vec<_>>());
    let methods = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.method_used().map(CorrectionMethod::as_str))
            .collect::<Vec<_>>(),
    );
    let confidences =
        Float64Array::from(outcomes.iter().map(|o| o.confidence()).collect::<Vec<_>>());
    let corrected =
        StringArray::from(outcomes.iter().map(|o| o.corrected_url()).collect::<Vec<_>>());
    let videos = StringArray::from(outcomes.iter().map(|o| o.video_url()).collect::<Vec<_>>());
    let categories = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.failure_category().map(FailureCategory::as_str))
            .collect::<Vec<_>>(),
    );
    let attempts = UInt32Array::from(
        outcomes
            .iter()
            .map(|o| o.methods_attempted.len() as u32)
            .collect::<Vec<_>>(),
    );
    let attempted_at = StringArray::from(
        outcomes
            .iter()
            .map(|o| Some(o.attempted_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(story_ids),
            Arc::new(successes),
            Arc::new(methods),
            Arc::new(confidences),
            Arc::new(corrected),
            Arc::new(videos),
            Arc::new(categories),
            Arc::new(attempts),
            Arc::new(attempted_at),
        ],
    )
    .context("building outcomes record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening outcomes parquet writer")?;
    writer.write(&batch).context("writing outcomes record batch")?;
    writer.into_inner().context("finishing outcomes parquet")
}

/// Markdown digest of the most recent `runs` batch reports under `reports_root`.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(OUTCOMES_FILE).is_file())
        .map(|entry| -> Result<(PathBuf, BatchSummary)> {
            let path = entry.path();
            let summary = std::fs::read_to_string(path.join(OUTCOMES_FILE))
                .with_context(|| format!("reading {}", path.join(OUTCOMES_FILE).display()))
                .and_then(|text| {
                    serde_json::from_str::<BatchSummary>(&text)
                        .with_context(|| format!("parsing {}", path.join(OUTCOMES_FILE).display()))
                })?;
            Ok((path, summary))
        })
        .collect::<Result<Vec<_>>>()?;
    dirs.sort_by_key(|(_, summary)| summary.started_at);
    dirs.reverse();

    let mut lines = vec!["# Locator Correction Runs".to_string(), String::new()];
    for (dir, summary) in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- corrected: {}/{} ({:.1}%)",
            summary.successful_corrections,
            summary.total_attempted,
            summary.success_rate()
        ));
        lines.push(format!("- tier1: {}, tier2: {}", summary.tier1_success, summary.tier2_success));
        for (category, count) in &summary.failure_categories {
            lines.push(format!("- {category}: {count}"));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
