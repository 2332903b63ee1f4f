//! Minimal reader for the tab-separated tables BIDS ships (events and
//! confounds files). Missing numeric cells are written as `n/a`; they parse
//! to NaN here and the caller decides what to substitute.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TableError;

#[derive(Debug, Clone)]
pub struct Table {
    path: Utf8PathBuf,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_path(path: &Utf8Path) -> Result<Self, TableError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TableError::Read(path.to_path_buf(), e))?;
        Self::parse(path, &text)
    }

    fn parse(path: &Utf8Path, text: &str) -> Result<Self, TableError> {
        let mut lines = text.lines().filter(|line| !line.is_empty());

        let header: Vec<String> = lines
            .next()
            .ok_or_else(|| TableError::Empty(path.to_path_buf()))?
            .split('\t')
            .map(|cell| cell.to_string())
            .collect();

        let mut rows = Vec::new();
        for (ix, line) in lines.enumerate() {
            let cells: Vec<String> = line.split('\t').map(|cell| cell.to_string()).collect();
            if cells.len() != header.len() {
                return Err(TableError::Ragged {
                    file: path.to_path_buf(),
                    row: ix + 1,
                    got: cells.len(),
                    expected: header.len(),
                });
            }
            rows.push(cells);
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.header.iter().any(|column| column == name)
    }

    fn column_ix(&self, name: &str) -> Result<usize, TableError> {
        self.header
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| TableError::MissingColumn {
                file: self.path.clone(),
                column: name.to_string(),
            })
    }

    /// Raw string cells of one column, in row order.
    pub fn column(&self, name: &str) -> Result<Vec<&str>, TableError> {
        let ix = self.column_ix(name)?;
        Ok(self.rows.iter().map(|row| row[ix].as_str()).collect())
    }

    /// Numeric cells of one column; `n/a` and empty cells become NaN.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, TableError> {
        let ix = self.column_ix(name)?;

        self.rows
            .iter()
            .enumerate()
            .map(|(row, cells)| {
                let cell = cells[ix].as_str();
                if cell == "n/a" || cell.is_empty() {
                    return Ok(f64::NAN);
                }
                cell.parse().map_err(|_| TableError::BadNumber {
                    file: self.path.clone(),
                    column: name.to_string(),
                    row: row + 1,
                    value: cell.to_string(),
                })
            })
            .collect()
    }
}
