//! Bounded parallel scan over columnar records
//!
//! The scan filters by fold and cut, derives the weight column and projects
//! the feature variables. Morsels are processed on a dedicated rayon pool of
//! `nthreads` workers; the indexed parallel iterator keeps output in input
//! order, so callers always see a deterministic, fully materialized batch.

use crate::expr::Expression;
use crate::fold::Fold;
use crate::storage::{column_u64, StorageEngine};
use crate::{Error, Result};
use arrow::array::{ArrayRef, BooleanArray, Float32Array};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Rows per scan task
pub const SCAN_MORSEL_ROWS: usize = 64 * 1024;

/// One filter/define/project pass over a record stream
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Event key column
    pub key: String,
    /// Keep only this fold (None keeps all events)
    pub fold: Option<Fold>,
    /// Cut predicate
    pub cut: Expression,
    /// Derived weight column: (name, expression)
    pub weight: Option<(String, Expression)>,
    /// Feature columns to export (as `Float32`)
    pub variables: Vec<String>,
}

impl ScanRequest {
    /// Schema of the scan output
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .variables
            .iter()
            .map(|v| Field::new(v, DataType::Float32, false))
            .collect();
        if let Some((name, _)) = &self.weight {
            fields.push(Field::new(name, DataType::Float32, false));
        }
        Arc::new(Schema::new(fields))
    }

    fn scan_morsel(&self, batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
        let cut = self.cut.evaluate_mask(batch)?;
        let mask: BooleanArray = match self.fold {
            Some(fold) => {
                let events = column_u64(batch, &self.key)?;
                cut.iter()
                    .zip(events)
                    .map(|(c, e)| Some(c == Some(true) && Fold::of_event(e) == fold))
                    .collect()
            }
            None => cut,
        };
        let filtered = compute::filter_record_batch(batch, &mask)?;

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for name in &self.variables {
            let source = crate::storage::column(&filtered, name)?;
            columns.push(compute::cast(source, &DataType::Float32)?);
        }
        if let Some((_, expr)) = &self.weight {
            #[allow(clippy::cast_possible_truncation)]
            let weights: Float32Array = expr
                .evaluate(&filtered)?
                .into_iter()
                .map(|w| w as f32)
                .collect();
            columns.push(Arc::new(weights));
        }
        Ok(RecordBatch::try_new(schema.clone(), columns)?)
    }
}

/// Bounded worker pool for record scanning
pub struct ScanPool {
    pool: ThreadPool,
    threads: usize,
}

impl std::fmt::Debug for ScanPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanPool")
            .field("threads", &self.threads)
            .finish()
    }
}

impl ScanPool {
    /// Create a pool with `threads` workers (at least one)
    ///
    /// # Errors
    /// Returns error if the pool cannot be spawned
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("xfold-scan-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build scan pool: {e}")))?;
        Ok(Self { pool, threads })
    }

    /// Number of worker threads
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Run a scan and return one batch in input order
    ///
    /// # Errors
    /// Returns the first error raised by any morsel
    pub fn scan(&self, storage: &StorageEngine, request: &ScanRequest) -> Result<RecordBatch> {
        let schema = request.output_schema();
        let morsels: Vec<RecordBatch> = storage.morsels_with_max_rows(SCAN_MORSEL_ROWS).collect();

        let parts = self.pool.install(|| {
            morsels
                .par_iter()
                .map(|m| request.scan_morsel(m, &schema))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(compute::concat_batches(&schema, &parts)?)
    }
}
