//! The persisted-matrix interface.
//!
//! Assembled operators and diagnostic fields can be written to, and read
//! back from, a named per-increment collection. Only the contract is fixed
//! here: the records are plain serde-serializable triplet/row-major blocks,
//! so any codec (JSON, binary, HDF-backed stores) can persist them; a
//! round-trip must reproduce the values within floating tolerance.

use eyre::Result;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::CouplingError;

/// A sparse matrix as (row, column, value) triplets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrixRecord {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseMatrixRecord {
    pub fn from_csc(matrix: &CscMatrix<f64>) -> Self {
        let mut rows = Vec::with_capacity(matrix.nnz());
        let mut cols = Vec::with_capacity(matrix.nnz());
        let mut values = Vec::with_capacity(matrix.nnz());
        for (i, j, &value) in matrix.triplet_iter() {
            rows.push(i);
            cols.push(j);
            values.push(value);
        }
        Self {
            nrows: matrix.nrows(),
            ncols: matrix.ncols(),
            rows,
            cols,
            values,
        }
    }

    pub fn to_csc(&self) -> Result<CscMatrix<f64>> {
        let coo = CooMatrix::try_from_triplets(
            self.nrows,
            self.ncols,
            self.rows.clone(),
            self.cols.clone(),
            self.values.clone(),
        )
        .map_err(|err| CouplingError::io("SparseMatrixRecord::to_csc", format!("invalid triplet data: {err}")))?;
        Ok(CscMatrix::from(&coo))
    }
}

/// A dense matrix as a row-major block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrixRecord {
    pub nrows: usize,
    pub ncols: usize,
    pub values: Vec<f64>,
}

impl DenseMatrixRecord {
    pub fn from_dmatrix(matrix: &DMatrix<f64>) -> Self {
        let mut values = Vec::with_capacity(matrix.nrows() * matrix.ncols());
        for i in 0..matrix.nrows() {
            for j in 0..matrix.ncols() {
                values.push(matrix[(i, j)]);
            }
        }
        Self {
            nrows: matrix.nrows(),
            ncols: matrix.ncols(),
            values,
        }
    }

    pub fn to_dmatrix(&self) -> Result<DMatrix<f64>> {
        if self.values.len() != self.nrows * self.ncols {
            return Err(CouplingError::io(
                "DenseMatrixRecord::to_dmatrix",
                format!(
                    "value count {} does not match dimensions {}x{}",
                    self.values.len(),
                    self.nrows,
                    self.ncols
                ),
            )
            .into());
        }
        Ok(DMatrix::from_row_slice(self.nrows, self.ncols, &self.values))
    }
}

/// A named, per-increment store of sparse and dense matrices.
///
/// Reading a name that was never written is an I/O error.
pub trait MatrixArchive {
    fn write_sparse(&mut self, increment: usize, name: &str, record: SparseMatrixRecord) -> Result<()>;

    fn write_dense(&mut self, increment: usize, name: &str, record: DenseMatrixRecord) -> Result<()>;

    fn read_sparse(&self, increment: usize, name: &str) -> Result<SparseMatrixRecord>;

    fn read_dense(&self, increment: usize, name: &str) -> Result<DenseMatrixRecord>;
}

/// An archive keeping every record in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArchive {
    sparse: FxHashMap<(usize, String), SparseMatrixRecord>,
    dense: FxHashMap<(usize, String), DenseMatrixRecord>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sparse_names(&self, increment: usize) -> Vec<&str> {
        let mut names: Vec<_> = self
            .sparse
            .keys()
            .filter(|(i, _)| *i == increment)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn dense_names(&self, increment: usize) -> Vec<&str> {
        let mut names: Vec<_> = self
            .dense
            .keys()
            .filter(|(i, _)| *i == increment)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

impl MatrixArchive for InMemoryArchive {
    fn write_sparse(&mut self, increment: usize, name: &str, record: SparseMatrixRecord) -> Result<()> {
        self.sparse.insert((increment, name.to_owned()), record);
        Ok(())
    }

    fn write_dense(&mut self, increment: usize, name: &str, record: DenseMatrixRecord) -> Result<()> {
        self.dense.insert((increment, name.to_owned()), record);
        Ok(())
    }

    fn read_sparse(&self, increment: usize, name: &str) -> Result<SparseMatrixRecord> {
        self.sparse.get(&(increment, name.to_owned())).cloned().ok_or_else(|| {
            CouplingError::io(
                "InMemoryArchive::read_sparse",
                format!("no sparse matrix '{name}' stored for increment {increment}"),
            )
            .into()
        })
    }

    fn read_dense(&self, increment: usize, name: &str) -> Result<DenseMatrixRecord> {
        self.dense.get(&(increment, name.to_owned())).cloned().ok_or_else(|| {
            CouplingError::io(
                "InMemoryArchive::read_dense",
                format!("no dense matrix '{name}' stored for increment {increment}"),
            )
            .into()
        })
    }
}
