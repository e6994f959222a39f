//! Storage backend (Arrow/Parquet)
//!
//! **Append-Only Design**:
//! - Event stores are immutable once read; stages only append derived batches
//! - Write pattern: whole artifacts, finalized by rename (no partial files)
//!
//! Toyota Way Principles:
//! - Poka-Yoke: Morsel-based paging bounds per-task memory (Funke et al. 2018)
//! - Muda elimination: Only the projected columns are materialized for training

use crate::fold::staging_path;
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float64Array, UInt64Array};
use arrow::compute;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;

/// Morsel size for out-of-core execution (128MB chunks)
/// Based on: Leis et al. (2014) morsel-driven parallelism
pub const MORSEL_SIZE_BYTES: usize = 128 * 1024 * 1024; // 128MB

/// Storage engine for Arrow/Parquet data
#[derive(Debug, Clone, Default)]
pub struct StorageEngine {
    batches: Vec<RecordBatch>,
}

impl StorageEngine {
    /// Create a new storage engine from existing batches
    ///
    /// Useful for testing and benchmarking
    #[must_use]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches }
    }

    /// Load table from Parquet file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = File::open(path.as_ref()).map_err(|e| {
            Error::StorageError(format!(
                "Failed to open Parquet file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            Error::StorageError(format!("Failed to parse Parquet file: {e}"))
        })?;

        let reader = builder.build().map_err(|e| {
            Error::StorageError(format!("Failed to create Parquet reader: {e}"))
        })?;

        // Read all batches into memory
        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| {
                Error::StorageError(format!("Failed to read record batch: {e}"))
            })?;
            batches.push(batch);
        }

        Ok(Self { batches })
    }

    /// Get all record batches
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total number of rows across batches
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Schema of the stored batches (None when empty)
    #[must_use]
    pub fn schema(&self) -> Option<SchemaRef> {
        self.batches.first().map(RecordBatch::schema)
    }

    /// Create iterator over morsels (128MB chunks)
    #[must_use]
    pub fn morsels(&self) -> MorselIterator<'_> {
        MorselIterator::new(&self.batches, usize::MAX)
    }

    /// Create iterator over morsels of at most `max_rows` rows (and 128MB)
    #[must_use]
    pub fn morsels_with_max_rows(&self, max_rows: usize) -> MorselIterator<'_> {
        MorselIterator::new(&self.batches, max_rows.max(1))
    }

    /// Append batches to storage
    ///
    /// # Errors
    ///
    /// Returns error if batch schema doesn't match existing batches
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        // Validate schema compatibility
        if !self.batches.is_empty() {
            let existing_schema = self.batches[0].schema();
            if batch.schema() != existing_schema {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing_schema,
                    batch.schema()
                )));
            }
        }

        self.batches.push(batch);
        Ok(())
    }

    /// Combine all batches into a single batch
    ///
    /// # Errors
    /// Returns error if storage is empty or batches cannot be concatenated
    pub fn concat(&self) -> Result<RecordBatch> {
        let Some(first) = self.batches.first() else {
            return Err(Error::StorageError("No batches in storage".to_string()));
        };
        if self.batches.len() == 1 {
            return Ok(first.clone());
        }
        compute::concat_batches(&first.schema(), &self.batches)
            .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}")))
    }

    /// Write all batches to a Parquet file atomically
    ///
    /// The file is written next to `path` and renamed into place only after the
    /// writer closed successfully, so a failure never leaves a partial artifact.
    ///
    /// # Errors
    /// Returns error if storage is empty or writing fails
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let schema = self
            .schema()
            .ok_or_else(|| Error::StorageError("Refusing to write empty storage".to_string()))?;
        write_batches_atomic(path.as_ref(), &schema, &self.batches)
    }
}

/// Write batches with a common schema to a Parquet file atomically
///
/// # Errors
/// Returns error if the file cannot be created, written or renamed
pub fn write_batches_atomic(path: &Path, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<()> {
    let tmp = staging_path(path);
    let result = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), None)
            .map_err(|e| Error::StorageError(format!("Failed to create Parquet writer: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| Error::StorageError(format!("Failed to write record batch: {e}")))?;
        }
        writer
            .close()
            .map_err(|e| Error::StorageError(format!("Failed to finalize Parquet file: {e}")))?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        fs::remove_file(&tmp).ok();
    }
    result
}

/// Look up a column by name
///
/// # Errors
/// Returns `InvalidInput` when the column is absent
pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::InvalidInput(format!("Column not found: {name}")))
}

/// Read a numeric column as `f64` values
///
/// # Errors
/// Returns error if the column is missing, not numeric, or contains nulls
pub fn column_f64(batch: &RecordBatch, name: &str) -> Result<Vec<f64>> {
    let cast = compute::cast(column(batch, name)?, &DataType::Float64)?;
    let array = cast
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::Other("Failed to downcast to Float64Array".to_string()))?;
    if array.null_count() > 0 {
        return Err(Error::StorageError(format!(
            "Column {name} contains {} null values",
            array.null_count()
        )));
    }
    Ok(array.values().to_vec())
}

/// Read an integer column (the event key) as `u64` values
///
/// # Errors
/// Returns error if the column is missing, not castable, or contains nulls
pub fn column_u64(batch: &RecordBatch, name: &str) -> Result<Vec<u64>> {
    let cast = compute::cast(column(batch, name)?, &DataType::UInt64)?;
    let array = cast
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| Error::Other("Failed to downcast to UInt64Array".to_string()))?;
    if array.null_count() > 0 {
        return Err(Error::StorageError(format!(
            "Column {name} contains {} null or out-of-range values",
            array.null_count()
        )));
    }
    Ok(array.values().to_vec())
}

/// Iterator over morsels of data
pub struct MorselIterator<'a> {
    batches: &'a [RecordBatch],
    current_batch_idx: usize,
    current_offset: usize,
    morsel_rows: usize,
}

impl<'a> MorselIterator<'a> {
    /// Create new morsel iterator
    fn new(batches: &'a [RecordBatch], max_rows: usize) -> Self {
        // Calculate morsel size based on first non-empty batch
        let morsel_rows = batches
            .iter()
            .find(|b| b.num_rows() > 0)
            .map_or(0, Self::calculate_morsel_rows)
            .min(max_rows);

        Self {
            batches,
            current_batch_idx: 0,
            current_offset: 0,
            morsel_rows,
        }
    }

    /// Calculate how many rows fit in a 128MB morsel
    fn calculate_morsel_rows(batch: &RecordBatch) -> usize {
        let num_rows = batch.num_rows();
        if num_rows == 0 {
            return 0;
        }

        let total_bytes = batch.get_array_memory_size();
        let bytes_per_row = total_bytes / num_rows;

        if bytes_per_row == 0 {
            return num_rows; // Avoid division by zero
        }

        MORSEL_SIZE_BYTES / bytes_per_row
    }
}

impl Iterator for MorselIterator<'_> {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current_batch = self.batches.get(self.current_batch_idx)?;

            // Exhausted current batch (or nothing fits): move on
            if self.current_offset >= current_batch.num_rows() || self.morsel_rows == 0 {
                self.current_batch_idx += 1;
                self.current_offset = 0;
                continue;
            }

            let remaining_rows = current_batch.num_rows() - self.current_offset;
            let slice_length = remaining_rows.min(self.morsel_rows);

            let morsel = current_batch.slice(self.current_offset, slice_length);
            self.current_offset += slice_length;

            return Some(morsel);
        }
    }
}
