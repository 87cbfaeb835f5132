//! Data
//!
//! Dense matrices, the immutable train/validation/test split handed to every stage,
//! and the CSV loader producing the prior and fair views of a dataset.
use crate::constants::{TRAIN_FRACTION, VALID_FRACTION};
use crate::errors::FairVaeError;
use crate::utils::cmp_rows;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Contiguous row-major matrix of `f32` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    /// The raw data, `rows * cols` values.
    pub data: Vec<f32>,
    /// Number of rows in the matrix.
    pub rows: usize,
    /// Number of columns in the matrix.
    pub cols: usize,
}

impl Matrix {
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self, FairVaeError> {
        if data.len() != rows * cols {
            return Err(FairVaeError::InvalidData(format!(
                "matrix of shape ({}, {}) needs {} values, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        Ok(Matrix { data, rows, cols })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, FairVaeError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != cols) {
            return Err(FairVaeError::InvalidData(format!(
                "row {} has {} columns, expected {}",
                bad,
                rows[bad].len(),
                cols
            )));
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Matrix::new(data, rows.len(), cols)
    }

    /// Get the ith row.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Copy the rows at `index`, in order, into a new buffer.
    pub fn gather(&self, index: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(index.len() * self.cols);
        for &i in index {
            out.extend_from_slice(self.row(i));
        }
        out
    }

    /// Rows at `index` as a `(index.len(), cols)` tensor on `device`.
    pub fn gather_tensor(&self, index: &[usize], device: &Device) -> Result<Tensor, FairVaeError> {
        Ok(Tensor::from_vec(self.gather(index), (index.len(), self.cols), device)?)
    }

    /// Copy a 2-d tensor back to the host.
    pub fn from_tensor(t: &Tensor) -> Result<Self, FairVaeError> {
        let (rows, cols) = t.dims2()?;
        let data = t.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Matrix::new(data, rows, cols)
    }

    /// Stack the rows of `parts`, which must share a column count.
    pub fn vconcat(parts: &[Matrix]) -> Result<Matrix, FairVaeError> {
        let cols = parts.first().map(|m| m.cols).unwrap_or(0);
        if let Some(bad) = parts.iter().find(|m| m.cols != cols) {
            return Err(FairVaeError::InvalidData(format!(
                "cannot stack a matrix with {} columns onto {} columns",
                bad.cols, cols
            )));
        }
        let data = parts.iter().flat_map(|m| m.data.iter().copied()).collect();
        Matrix::new(data, parts.iter().map(|m| m.rows).sum(), cols)
    }

    /// Join the columns of `other` to the right of this matrix.
    pub fn hconcat(&self, other: &Matrix) -> Result<Matrix, FairVaeError> {
        if self.rows != other.rows {
            return Err(FairVaeError::InvalidData(format!(
                "cannot join matrices with {} and {} rows",
                self.rows, other.rows
            )));
        }
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        for i in 0..self.rows {
            data.extend_from_slice(self.row(i));
            data.extend_from_slice(other.row(i));
        }
        Matrix::new(data, self.rows, self.cols + other.cols)
    }
}

/// Explicit index sets, as stored in `splits.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
    #[serde(default)]
    pub test: Vec<usize>,
}

/// Split `n` samples by fixed 70%/20% proportions. The last ~10% is left out of
/// both sets and the test set is empty.
pub fn proportional_split(n: usize) -> SplitIndices {
    let train_cnt = (n as f64 * TRAIN_FRACTION) as usize;
    let valid_cnt = (n as f64 * VALID_FRACTION) as usize;
    SplitIndices {
        train: (0..train_cnt).collect(),
        valid: (train_cnt..train_cnt + valid_cnt).collect(),
        test: Vec::new(),
    }
}

/// Which index set of a split an operation runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitKind {
    Train,
    Valid,
    Test,
}

impl SplitKind {
    pub fn name(&self) -> &'static str {
        match self {
            SplitKind::Train => "train",
            SplitKind::Valid => "valid",
            SplitKind::Test => "test",
        }
    }
}

/// Feature matrix, binary label matrix, optional sensitive attributes and the
/// index sets over them. Validated once at construction and never mutated.
#[derive(Debug, Clone)]
pub struct DataSplit {
    features: Matrix,
    labels: Matrix,
    sensitive: Option<Matrix>,
    train_idx: Vec<usize>,
    valid_idx: Vec<usize>,
    test_idx: Vec<usize>,
    batch_size: usize,
}

impl DataSplit {
    pub fn new(
        features: Matrix,
        labels: Matrix,
        sensitive: Option<Matrix>,
        splits: SplitIndices,
        batch_size: usize,
    ) -> Result<Self, FairVaeError> {
        let n = features.rows;
        if labels.rows != n {
            return Err(FairVaeError::InvalidData(format!(
                "{} feature rows but {} label rows",
                n, labels.rows
            )));
        }
        if let Some(s) = &sensitive {
            if s.rows != n {
                return Err(FairVaeError::InvalidData(format!(
                    "{} feature rows but {} sensitive rows",
                    n, s.rows
                )));
            }
        }
        if batch_size == 0 {
            return Err(FairVaeError::InvalidParameter(
                "batch_size".to_string(),
                "a positive integer".to_string(),
                "0".to_string(),
            ));
        }
        if let Some(v) = labels.data.iter().find(|v| **v != 0.0 && **v != 1.0) {
            return Err(FairVaeError::InvalidData(format!("label matrix holds non binary value {}", v)));
        }

        let mut owner = vec![None; n];
        for (name, idx) in [("train", &splits.train), ("valid", &splits.valid), ("test", &splits.test)] {
            for &i in idx.iter() {
                if i >= n {
                    return Err(FairVaeError::InvalidData(format!(
                        "{} index {} is out of bounds for {} samples",
                        name, i, n
                    )));
                }
                match owner[i] {
                    None => owner[i] = Some(name),
                    Some(other) if other == name => {
                        return Err(FairVaeError::InvalidData(format!("{} index {} appears twice", name, i)))
                    }
                    Some(other) => {
                        return Err(FairVaeError::InvalidData(format!(
                            "index {} belongs to both {} and {}",
                            i, other, name
                        )))
                    }
                }
            }
        }

        Ok(DataSplit {
            features,
            labels,
            sensitive,
            train_idx: splits.train,
            valid_idx: splits.valid,
            test_idx: splits.test,
            batch_size,
        })
    }

    pub fn features(&self) -> &Matrix {
        &self.features
    }

    pub fn labels(&self) -> &Matrix {
        &self.labels
    }

    pub fn sensitive(&self) -> Option<&Matrix> {
        self.sensitive.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn feature_dim(&self) -> usize {
        self.features.cols
    }

    pub fn label_dim(&self) -> usize {
        self.labels.cols
    }

    pub fn indices(&self, kind: SplitKind) -> &[usize] {
        match kind {
            SplitKind::Train => &self.train_idx,
            SplitKind::Valid => &self.valid_idx,
            SplitKind::Test => &self.test_idx,
        }
    }

    pub fn train_idx(&self) -> &[usize] {
        &self.train_idx
    }

    pub fn valid_idx(&self) -> &[usize] {
        &self.valid_idx
    }

    pub fn test_idx(&self) -> &[usize] {
        &self.test_idx
    }

    /// Feature and label tensors for the samples at `index`.
    pub fn batch(&self, index: &[usize], device: &Device) -> Result<(Tensor, Tensor), FairVaeError> {
        Ok((
            self.features.gather_tensor(index, device)?,
            self.labels.gather_tensor(index, device)?,
        ))
    }
}

/// Sensitive group of every sample, groups being the unique rows of the sensitive
/// matrix in lexicographic order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupIndex {
    pub groups: Vec<Vec<f32>>,
    pub membership: Vec<usize>,
}

impl GroupIndex {
    pub fn from_matrix(m: &Matrix) -> Self {
        let mut groups: Vec<Vec<f32>> = (0..m.rows).map(|i| m.row(i).to_vec()).collect();
        groups.sort_by(|a, b| cmp_rows(a, b));
        groups.dedup_by(|a, b| cmp_rows(a, b).is_eq());
        let membership = (0..m.rows)
            .map(|i| {
                groups
                    .binary_search_by(|g| cmp_rows(g, m.row(i)))
                    .unwrap_or_default()
            })
            .collect();
        GroupIndex { groups, membership }
    }

    pub fn group_of(&self, sample: usize) -> usize {
        self.membership[sample]
    }
}

/// How the sensitive attributes are exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataView {
    /// Sensitive columns are appended to the features, nothing is kept aside.
    Prior,
    /// Sensitive columns are kept out of the features and attached separately.
    Fair,
}

fn parse_record(record: &csv::StringRecord) -> Option<Vec<f32>> {
    record.iter().map(|v| v.trim().parse::<f32>().ok()).collect()
}

/// Read a numeric CSV file. A first row that does not parse as numbers is taken as a header.
pub fn read_csv_matrix<P: AsRef<Path>>(path: P) -> Result<Matrix, FairVaeError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.display(), e)))?;
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.display(), e)))?;
        match parse_record(&record) {
            Some(row) => rows.push(row),
            None if i == 0 => continue,
            None => {
                return Err(FairVaeError::InvalidData(format!(
                    "{}: row {} is not numeric",
                    path.display(),
                    i
                )))
            }
        }
    }
    Matrix::from_rows(&rows)
}

/// Load `<data_dir>/<dataset>` as a `DataSplit`.
///
/// The directory holds `features.csv`, `labels.csv`, optionally `sensitive.csv`, and
/// optionally `splits.json` with explicit index sets. Without `splits.json` the
/// samples are split by proportion.
pub fn load_data<P: AsRef<Path>>(
    data_dir: P,
    dataset: &str,
    view: DataView,
    batch_size: usize,
) -> Result<DataSplit, FairVaeError> {
    let root = data_dir.as_ref().join(dataset);
    let features = read_csv_matrix(root.join("features.csv"))?;
    let labels = read_csv_matrix(root.join("labels.csv"))?;
    let sensitive_path = root.join("sensitive.csv");
    let sensitive = if sensitive_path.exists() {
        Some(read_csv_matrix(&sensitive_path)?)
    } else {
        None
    };

    let splits_path = root.join("splits.json");
    let splits = if splits_path.exists() {
        let json_str = fs::read_to_string(&splits_path)
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", splits_path.display(), e)))?;
        serde_json::from_str::<SplitIndices>(&json_str)
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", splits_path.display(), e)))?
    } else {
        proportional_split(features.rows)
    };

    match view {
        DataView::Prior => {
            let features = match &sensitive {
                Some(s) => features.hconcat(s)?,
                None => features,
            };
            DataSplit::new(features, labels, None, splits, batch_size)
        }
        DataView::Fair => {
            let sensitive = sensitive.ok_or(FairVaeError::MissingSensitive)?;
            DataSplit::new(features, labels, Some(sensitive), splits, batch_size)
        }
    }
}
