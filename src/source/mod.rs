//! Record source merger
//!
//! A dataset is the primary event stream (one or more source ids, chained in
//! order) joined with auxiliary "friend" streams that carry extra per-event
//! columns under a different base path. Rows are matched on the event key.
//!
//! ## On-disk layout
//!
//! ```text
//! <base>/<source_id>/                  required source directory
//! <base>/<source_id>/<variant>.parquet one variant (nominal or systematic shift)
//! ```
//!
//! A missing source directory is fatal. A missing variant can be probed with
//! [`SourceContext::variant_available`] so callers may skip it.
//!
//! Source files are read in full when opened; the loaded columns are owned
//! by a [`SourceContext`] and dropped together when it is closed or dropped.
//! Datasets handed out share those columns.

use crate::storage::{column_u64, StorageEngine};
use crate::{Error, Result};
use arrow::array::{ArrayRef, UInt64Array};
use arrow::compute;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Where record sources live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    /// Base of the primary event stream
    pub primary: PathBuf,
    /// Bases of auxiliary column sources, joined in order
    pub friends: Vec<PathBuf>,
    /// Event key column shared by all sources
    pub key: String,
}

impl SourceLayout {
    /// Directory of one source under a base
    #[must_use]
    pub fn source_dir(base: &Path, source_id: &str) -> PathBuf {
        base.join(source_id)
    }

    /// File of one variant of a source under a base
    #[must_use]
    pub fn variant_path(base: &Path, source_id: &str, variant: &str) -> PathBuf {
        Self::source_dir(base, source_id).join(format!("{variant}.parquet"))
    }
}

/// Loaded contents of one source file
#[derive(Debug)]
struct OpenSource {
    path: PathBuf,
    storage: StorageEngine,
}

/// Owner of every source loaded during dataset assembly
#[derive(Debug)]
pub struct SourceContext {
    layout: SourceLayout,
    open: Vec<OpenSource>,
}

impl SourceContext {
    /// Create a context for a layout
    #[must_use]
    pub const fn new(layout: SourceLayout) -> Self {
        Self {
            layout,
            open: Vec::new(),
        }
    }

    /// Layout this context reads from
    #[must_use]
    pub const fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    /// Number of source files currently held
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Rows held across every loaded source
    #[must_use]
    pub fn held_rows(&self) -> usize {
        self.open.iter().map(|s| s.storage.num_rows()).sum()
    }

    /// Check whether a variant exists for a source
    ///
    /// # Errors
    /// Returns `MissingInput` if the source directory itself is absent
    pub fn variant_available(&self, source_id: &str, variant: &str) -> Result<bool> {
        let dir = SourceLayout::source_dir(&self.layout.primary, source_id);
        if !dir.is_dir() {
            error!(path = %dir.display(), "Source does not exist");
            return Err(Error::MissingInput(format!(
                "Source {} does not exist",
                dir.display()
            )));
        }
        Ok(SourceLayout::variant_path(&self.layout.primary, source_id, variant).is_file())
    }

    /// Open and chain the given sources under one base
    ///
    /// # Errors
    /// Returns `MissingInput` if any source file is absent
    pub fn open(
        &mut self,
        source_ids: &[String],
        base: &Path,
        variant: &str,
    ) -> Result<StorageEngine> {
        let mut chain = StorageEngine::default();
        for id in source_ids {
            let path = SourceLayout::variant_path(base, id, variant);
            if !path.is_file() {
                error!(path = %path.display(), "File does not exist");
                return Err(Error::MissingInput(format!(
                    "File {} does not exist",
                    path.display()
                )));
            }
            let storage = StorageEngine::load_parquet(&path)?;
            debug!(path = %path.display(), rows = storage.num_rows(), "Opened source");
            for batch in storage.batches() {
                chain.append_batch(batch.clone())?;
            }
            self.open.push(OpenSource { path, storage });
        }
        Ok(chain)
    }

    /// Build the merged dataset: primary chain joined with every friend chain
    ///
    /// # Errors
    /// Returns error if any source is missing or the join fails
    pub fn dataset(&mut self, source_ids: &[String], variant: &str) -> Result<RecordBatch> {
        let primary_base = self.layout.primary.clone();
        let primary = self.open(source_ids, &primary_base, variant)?;
        if primary.batches().is_empty() {
            return Err(Error::MissingInput(format!(
                "Sources {source_ids:?} ({variant}) contain no record batches"
            )));
        }
        let mut merged = primary.concat()?;

        for base in self.layout.friends.clone() {
            let friend = self.open(source_ids, &base, variant)?;
            if friend.batches().is_empty() {
                return Err(Error::MissingInput(format!(
                    "Friend sources {source_ids:?} under {} contain no record batches",
                    base.display()
                )));
            }
            merged = join(&merged, &friend.concat()?, &self.layout.key)?;
        }
        Ok(merged)
    }

    /// Release every held source
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.open.is_empty() {
            return;
        }
        info!(
            sources = self.open.len(),
            rows = self.held_rows(),
            "Releasing record sources"
        );
        for source in self.open.drain(..) {
            debug!(
                path = %source.path.display(),
                rows = source.storage.num_rows(),
                "Released source"
            );
        }
    }
}

impl Drop for SourceContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Join auxiliary columns onto a primary batch by event key
///
/// Every primary event must appear exactly once in the friend. Friend columns
/// whose names already exist in the primary are shadowed by the primary.
///
/// # Errors
/// Returns `CountMismatch` if primary events are missing from the friend and
/// `InvalidInput` on duplicate friend keys
pub fn join(primary: &RecordBatch, friend: &RecordBatch, key: &str) -> Result<RecordBatch> {
    let primary_keys = column_u64(primary, key)?;
    let friend_keys = column_u64(friend, key)?;

    let indices = if primary_keys == friend_keys {
        None
    } else {
        let mut lookup = HashMap::with_capacity(friend_keys.len());
        for (row, &event) in friend_keys.iter().enumerate() {
            if lookup.insert(event, row as u64).is_some() {
                return Err(Error::InvalidInput(format!(
                    "Duplicate event {event} in auxiliary source"
                )));
            }
        }
        let rows: Vec<u64> = primary_keys
            .iter()
            .filter_map(|event| lookup.get(event).copied())
            .collect();
        if rows.len() != primary_keys.len() {
            return Err(Error::CountMismatch {
                context: "join of auxiliary source".to_string(),
                expected: primary_keys.len(),
                actual: rows.len(),
            });
        }
        Some(UInt64Array::from(rows))
    };

    let primary_schema = primary.schema();
    let mut fields: Vec<Field> = primary_schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<ArrayRef> = primary.columns().to_vec();

    let friend_schema = friend.schema();
    for (field, column) in friend_schema.fields().iter().zip(friend.columns()) {
        if primary_schema.field_with_name(field.name()).is_ok() {
            if field.name() != key {
                debug!(column = %field.name(), "Friend column shadowed by primary");
            }
            continue;
        }
        let aligned = match &indices {
            Some(idx) => compute::take(column.as_ref(), idx, None)?,
            None => column.clone(),
        };
        fields.push(field.as_ref().clone());
        columns.push(aligned);
    }

    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        columns,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column_f64;
    use arrow::array::{Float32Array, Int64Array};
    use arrow::datatypes::DataType;

    fn batch(events: &[i64], column: &str, values: &[f32]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("event", DataType::Int64, false),
            Field::new(column, DataType::Float32, false),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(events.to_vec())),
                Arc::new(Float32Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    fn write(base: &Path, id: &str, variant: &str, batch: RecordBatch) {
        let dir = SourceLayout::source_dir(base, id);
        std::fs::create_dir_all(&dir).unwrap();
        StorageEngine::new(vec![batch])
            .write_parquet(SourceLayout::variant_path(base, id, variant))
            .unwrap();
    }

    #[test]
    fn test_join_aligned() {
        let primary = batch(&[1, 2, 3], "pt_1", &[10.0, 20.0, 30.0]);
        let friend = batch(&[1, 2, 3], "njets", &[0.0, 1.0, 2.0]);
        let merged = join(&primary, &friend, "event").unwrap();
        assert_eq!(merged.num_columns(), 3);
        assert_eq!(column_f64(&merged, "njets").unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_join_reorders_by_key() {
        let primary = batch(&[1, 2, 3], "pt_1", &[10.0, 20.0, 30.0]);
        let friend = batch(&[3, 1, 2], "njets", &[2.0, 0.0, 1.0]);
        let merged = join(&primary, &friend, "event").unwrap();
        assert_eq!(column_f64(&merged, "njets").unwrap(), vec![0.0, 1.0, 2.0]);
        assert_eq!(column_f64(&merged, "pt_1").unwrap(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_join_missing_event_fails() {
        let primary = batch(&[1, 2, 3], "pt_1", &[10.0, 20.0, 30.0]);
        let friend = batch(&[1, 3], "njets", &[0.0, 2.0]);
        let err = join(&primary, &friend, "event").unwrap_err();
        assert!(matches!(err, Error::CountMismatch { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn test_join_duplicate_key_fails() {
        let primary = batch(&[1, 2], "pt_1", &[10.0, 20.0]);
        let friend = batch(&[2, 1, 1], "njets", &[0.0, 1.0, 2.0]);
        assert!(matches!(
            join(&primary, &friend, "event"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_join_primary_shadows_friend() {
        let primary = batch(&[1, 2], "pt_1", &[10.0, 20.0]);
        let friend = batch(&[1, 2], "pt_1", &[-1.0, -2.0]);
        let merged = join(&primary, &friend, "event").unwrap();
        assert_eq!(merged.num_columns(), 2);
        assert_eq!(column_f64(&merged, "pt_1").unwrap(), vec![10.0, 20.0]);
    }

    #[test]
    fn test_dataset_chains_and_joins() {
        let dir = tempfile::tempdir().unwrap();
        let ntuples = dir.path().join("ntuples");
        let friends = dir.path().join("friends");
        write(&ntuples, "a", "mt_nominal", batch(&[1, 2], "pt_1", &[1.0, 2.0]));
        write(&ntuples, "b", "mt_nominal", batch(&[3], "pt_1", &[3.0]));
        write(&friends, "a", "mt_nominal", batch(&[2, 1], "mjj", &[20.0, 10.0]));
        write(&friends, "b", "mt_nominal", batch(&[3], "mjj", &[30.0]));

        let mut ctx = SourceContext::new(SourceLayout {
            primary: ntuples,
            friends: vec![friends],
            key: "event".to_string(),
        });
        let merged = ctx
            .dataset(&["a".to_string(), "b".to_string()], "mt_nominal")
            .unwrap();

        assert_eq!(ctx.open_count(), 4);
        assert_eq!(ctx.held_rows(), 6);
        assert_eq!(column_f64(&merged, "mjj").unwrap(), vec![10.0, 20.0, 30.0]);
        ctx.close();
        // The dataset outlives the context that loaded it
        assert_eq!(merged.num_rows(), 3);
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = SourceContext::new(SourceLayout {
            primary: dir.path().to_path_buf(),
            friends: vec![],
            key: "event".to_string(),
        });
        assert!(matches!(
            ctx.dataset(&["absent".to_string()], "mt_nominal"),
            Err(Error::MissingInput(_))
        ));
        assert!(matches!(
            ctx.variant_available("absent", "mt_nominal"),
            Err(Error::MissingInput(_))
        ));
    }

    #[test]
    fn test_missing_variant_is_probeable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a", "mt_nominal", batch(&[1], "pt_1", &[1.0]));
        let ctx = SourceContext::new(SourceLayout {
            primary: dir.path().to_path_buf(),
            friends: vec![],
            key: "event".to_string(),
        });
        assert!(ctx.variant_available("a", "mt_nominal").unwrap());
        assert!(!ctx.variant_available("a", "mt_jerUncUp").unwrap());
    }
}
