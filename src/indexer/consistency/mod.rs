// Consistency validation between the index artifacts, the registry and the
// entry mapping

use anyhow::{Context, Result};
use itertools::Itertools;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::database::sqlite::{
    Database, IndexFile, IndexFileQueries, SegmentQueries, VectorIndexEntryQueries,
};
use crate::index::{IndexEngine, IndexKey};
use crate::index::storage::{self, FILE_EXTENSION};


/// Result of comparing every key's registry row, entries and artifact
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsistencyReport {
    /// Keys that have entries or a valid registry row
    pub keys_checked: usize,
    pub total_entries: i64,
    pub inconsistent_keys: Vec<KeyConsistencyIssue>,
    /// Segments flagged vectorized without an entry backing them
    pub flagged_without_entry: Vec<i64>,
    /// Artifact files in the index directory no valid row refers to
    pub unreferenced_files: Vec<String>,
    pub is_consistent: bool,
}

/// Disagreement between the stores for one `(group, type)` key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConsistencyIssue {
    pub key: IndexKey,
    /// `vector_count` of the valid registry row
    pub registry_count: Option<i64>,
    pub entry_count: i64,
    /// Vector count read from the artifact header
    pub artifact_count: Option<i64>,
    pub max_position: Option<i64>,
    pub problem: String,
}

/// Counts removed by [`ConsistencyValidator::cleanup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub invalid_rows_deleted: u64,
    pub orphaned_entries_deleted: u64,
    pub files_deleted: usize,
}

/// Checks and repairs the agreement between the metadata store and the
/// artifacts on disk. Meant to run while no flush is in flight.
pub struct ConsistencyValidator<'a> {
    engine: &'a IndexEngine,
    database: &'a Database,
    index_dir: &'a Path,
}

impl<'a> ConsistencyValidator<'a> {
    #[inline]
    pub fn new(engine: &'a IndexEngine) -> Self {
        Self {
            engine,
            database: engine.database(),
            index_dir: engine.index_dir(),
        }
    }

    #[inline]
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport> {
        info!("Starting index consistency validation");
        let pool = self.database.pool();

        let valid_files = IndexFileQueries::list_valid(pool).await?;
        let entry_keys = VectorIndexEntryQueries::list_keys(pool).await?;

        let keys: Vec<IndexKey> = valid_files
            .iter()
            .map(|file| IndexKey::new(file.group_id, file.index_type))
            .chain(
                entry_keys
                    .into_iter()
                    .map(|(group_id, vector_type)| IndexKey::new(group_id, vector_type)),
            )
            .unique()
            .collect();
        debug!("Checking {} index keys", keys.len());

        let mut report = ConsistencyReport {
            keys_checked: keys.len(),
            ..ConsistencyReport::default()
        };

        for key in keys {
            let file = valid_files
                .iter()
                .find(|f| f.group_id == key.group_id && f.index_type == key.index_type);
            let (entry_count, issue) = self.check_key(key, file).await?;
            report.total_entries += entry_count;
            if let Some(issue) = issue {
                report.inconsistent_keys.push(issue);
            }
        }

        report.flagged_without_entry = SegmentQueries::list_flagged_without_entry(pool).await?;
        report.unreferenced_files = self.unreferenced_files(&valid_files).await?;

        report.is_consistent = report.inconsistent_keys.is_empty()
            && report.flagged_without_entry.is_empty()
            && report.unreferenced_files.is_empty();

        if report.is_consistent {
            info!("Index consistency validation passed");
        } else {
            warn!("Index consistency validation found issues");
            log_consistency_issues(&report);
        }

        Ok(report)
    }

    async fn check_key(
        &self,
        key: IndexKey,
        file: Option<&IndexFile>,
    ) -> Result<(i64, Option<KeyConsistencyIssue>)> {
        let pool = self.database.pool();
        let mut conn = pool.acquire().await.context("Failed to acquire connection")?;
        let entry_count =
            VectorIndexEntryQueries::count_for_key(&mut conn, key.group_id, key.index_type).await?;
        drop(conn);
        let max_position =
            VectorIndexEntryQueries::max_position(pool, key.group_id, key.index_type).await?;

        let mut issue = KeyConsistencyIssue {
            key,
            registry_count: file.map(|f| f.vector_count),
            entry_count,
            artifact_count: None,
            max_position,
            problem: String::new(),
        };

        let Some(file) = file else {
            issue.problem = format!("{entry_count} entries but no valid index file");
            return Ok((entry_count, Some(issue)));
        };

        let header = match storage::read_header(&self.index_dir.join(&file.file_path)).await {
            Ok(header) => header,
            Err(e) => {
                issue.problem = format!("artifact {} unreadable: {}", file.file_path, e);
                return Ok((entry_count, Some(issue)));
            }
        };
        let artifact_count = header.vector_count as i64;
        issue.artifact_count = Some(artifact_count);

        let problem = if artifact_count != file.vector_count {
            Some(format!(
                "artifact holds {artifact_count} vectors, registry records {}",
                file.vector_count
            ))
        } else if entry_count != file.vector_count {
            Some(format!(
                "{entry_count} entries, registry records {}",
                file.vector_count
            ))
        } else if max_position.is_some_and(|max| max >= artifact_count) {
            Some(format!(
                "highest position {} is past the artifact's {artifact_count} vectors",
                max_position.unwrap_or_default()
            ))
        } else {
            None
        };

        Ok((
            entry_count,
            problem.map(|problem| KeyConsistencyIssue { problem, ..issue }),
        ))
    }

    async fn unreferenced_files(&self, valid_files: &[IndexFile]) -> Result<Vec<String>> {
        let referenced: HashSet<&str> = valid_files.iter().map(|f| f.file_path.as_str()).collect();
        let mut unreferenced = Vec::new();

        let mut dir = match tokio::fs::read_dir(self.index_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(unreferenced),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to list index directory {}", self.index_dir.display())
                });
            }
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to read index directory entry")?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != FILE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !referenced.contains(name) {
                unreferenced.push(name.to_string());
            }
        }

        unreferenced.sort_unstable();
        Ok(unreferenced)
    }

    /// Removes entries whose source entity is gone, then invalid registry
    /// rows, then artifact files no valid row refers to.
    ///
    /// Orphans are removed key by key through the engine, which compacts
    /// the artifact into a new generation under the key's write lock. The
    /// superseded generation is collected by the later steps of the same
    /// run.
    #[inline]
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let pool = self.database.pool();
        info!("Cleaning up index metadata and artifacts");

        let mut orphaned_entries_deleted = 0;
        for (group_id, vector_type) in VectorIndexEntryQueries::list_orphan_keys(pool).await? {
            let key = IndexKey::new(group_id, vector_type);
            orphaned_entries_deleted += self
                .engine
                .purge_orphans(key)
                .await
                .with_context(|| format!("Failed to remove orphaned entries of {key}"))?;
        }

        let invalid_rows_deleted = IndexFileQueries::delete_invalid(pool).await?;

        let valid_files = IndexFileQueries::list_valid(pool).await?;
        let mut files_deleted = 0;
        for name in self.unreferenced_files(&valid_files).await? {
            let path = self.index_dir.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed unreferenced artifact {}", path.display());
                    files_deleted += 1;
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        let report = CleanupReport {
            invalid_rows_deleted,
            orphaned_entries_deleted,
            files_deleted,
        };
        info!(
            "Cleanup removed {} invalid rows, {} orphaned entries, {} files",
            report.invalid_rows_deleted, report.orphaned_entries_deleted, report.files_deleted
        );
        Ok(report)
    }
}

fn log_consistency_issues(report: &ConsistencyReport) {
    for issue in &report.inconsistent_keys {
        warn!("{}: {}", issue.key, issue.problem);
    }

    if !report.flagged_without_entry.is_empty() {
        warn!(
            "Found {} segments flagged vectorized without an entry",
            report.flagged_without_entry.len()
        );
    }

    if !report.unreferenced_files.is_empty() {
        warn!(
            "Found {} unreferenced artifact files",
            report.unreferenced_files.len()
        );
    }
}

impl ConsistencyReport {
    /// Human-readable summary of the report
    #[inline]
    pub fn summary(&self) -> String {
        if self.is_consistent {
            format!(
                "Indexes are consistent: {} keys, {} entries",
                self.keys_checked, self.total_entries
            )
        } else {
            format!(
                "Index inconsistencies found: {} keys with issues, {} segments flagged without entries, {} unreferenced files",
                self.inconsistent_keys.len(),
                self.flagged_without_entry.len(),
                self.unreferenced_files.len()
            )
        }
    }

    #[inline]
    pub fn total_issues(&self) -> usize {
        self.inconsistent_keys.len()
            + self.flagged_without_entry.len()
            + self.unreferenced_files.len()
    }
}
