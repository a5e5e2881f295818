//! Dataset loading from CSV files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftError};

/// Row-oriented in-memory table read from a CSV file with a header row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Read a CSV file.
    ///
    /// # Errors
    ///
    /// Returns a `Dataset` error if the file does not exist and a `Csv` error
    /// if it cannot be parsed (including rows with a wrong field count).
    pub fn from_csv(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SftError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }

        let mut reader = csv::Reader::from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(ToString::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(ToString::to_string).collect());
        }

        Ok(Self { columns, rows })
    }

    /// Column names in file order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one column.
    ///
    /// # Errors
    ///
    /// Returns a `Dataset` error if the column does not exist.
    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let index = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| {
                SftError::Dataset(format!(
                    "missing column '{name}' (available: {})",
                    self.columns.join(", ")
                ))
            })?;

        Ok(self.rows.iter().map(|row| row[index].as_str()).collect())
    }
}

/// A single training example in the shape the trainer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRecord {
    /// Full text the model is trained on.
    pub text: String,
}

/// Train and validation splits.
#[derive(Debug, Clone)]
pub struct SftDatasets {
    /// Training examples.
    pub train: Vec<TextRecord>,
    /// Validation examples.
    pub validation: Vec<TextRecord>,
}

impl SftDatasets {
    /// Load both splits and adapt them into text records.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or malformed, or lacks `text_field`.
    pub fn load(train_file: &Path, validation_file: &Path, text_field: &str) -> Result<Self> {
        let train = records(&Table::from_csv(train_file)?, text_field)?;
        let validation = records(&Table::from_csv(validation_file)?, text_field)?;

        tracing::info!(
            "Loaded {} training and {} validation records",
            train.len(),
            validation.len()
        );

        Ok(Self { train, validation })
    }

    /// Build splits from in-memory records.
    #[must_use]
    pub fn from_records(train: Vec<TextRecord>, validation: Vec<TextRecord>) -> Self {
        Self { train, validation }
    }

    /// Get number of training examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.train.len()
    }

    /// Check if the training split is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.train.is_empty()
    }
}

fn records(table: &Table, text_field: &str) -> Result<Vec<TextRecord>> {
    Ok(table
        .column(text_field)?
        .into_iter()
        .map(|text| TextRecord {
            text: text.to_string(),
        })
        .collect())
}
