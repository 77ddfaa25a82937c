// index.rs

use crate::encoding::{LocusMapping, MISSING_CODE};
use crate::error::{ProfileStoreError, Result};
use crate::matrix::{ElementWidth, MatrixHeader};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Metadata that travels with a profile matrix: sample ids in row order, locus
/// names in column order, element width, shape and the per-locus allele mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreIndex {
    pub samples: Vec<String>,
    pub loci: Vec<String>,
    pub dtype: ElementWidth,
    pub shape: [usize; 2],
    pub mappings: Vec<LocusMapping>,
}

impl StoreIndex {
    pub fn new(samples: Vec<String>, loci: Vec<String>, dtype: ElementWidth, mappings: Vec<LocusMapping>) -> Self {
        let shape = [samples.len(), mappings.len()];
        Self { samples, loci, dtype, shape, mappings }
    }

    pub fn num_profiles(&self) -> usize {
        self.shape[0]
    }

    pub fn num_loci(&self) -> usize {
        self.shape[1]
    }

    pub fn matrix_header(&self) -> MatrixHeader {
        MatrixHeader::new(self.dtype, self.shape[0], self.shape[1])
    }

    /// Checks the index against itself: every list must agree with `shape`, and no
    /// allele may be bound to the missing code.
    pub fn validate(&self) -> Result<()> {
        let [num_profiles, num_loci] = self.shape;
        if self.samples.len() != num_profiles {
            return Err(ProfileStoreError::corruption(format!(
                "index lists {} samples but shape declares {} rows",
                self.samples.len(),
                num_profiles
            )));
        }
        if self.mappings.len() != num_loci {
            return Err(ProfileStoreError::corruption(format!(
                "index has {} locus mappings but shape declares {} loci",
                self.mappings.len(),
                num_loci
            )));
        }
        if !self.loci.is_empty() && self.loci.len() != num_loci {
            return Err(ProfileStoreError::corruption(format!(
                "index names {} loci but shape declares {}",
                self.loci.len(),
                num_loci
            )));
        }
        for (locus_idx, locus_mapping) in self.mappings.iter().enumerate() {
            if let Some((allele, _)) = locus_mapping.iter().find(|(_, code)| *code == MISSING_CODE) {
                return Err(ProfileStoreError::corruption(format!(
                    "allele '{}' of locus {} is bound to the reserved missing code",
                    allele, locus_idx
                )));
            }
            if locus_mapping.max_code() > self.dtype.max_code() {
                return Err(ProfileStoreError::corruption(format!(
                    "locus {} uses code {} which does not fit in {}",
                    locus_idx,
                    locus_mapping.max_code(),
                    self.dtype
                )));
            }
        }
        Ok(())
    }

    /// Checks the index against the header of the matrix it is paired with.
    pub fn validate_against(&self, header: &MatrixHeader) -> Result<()> {
        if header.num_rows != self.shape[0] || header.num_cols != self.shape[1] {
            return Err(ProfileStoreError::corruption(format!(
                "index shape [{}, {}] disagrees with matrix shape [{}, {}]",
                self.shape[0], self.shape[1], header.num_rows, header.num_cols
            )));
        }
        if header.width != self.dtype {
            return Err(ProfileStoreError::corruption(format!(
                "index dtype {} disagrees with matrix dtype {}",
                self.dtype, header.width
            )));
        }
        Ok(())
    }

    /// Display name of a locus, falling back to its column number.
    pub fn locus_name(&self, locus_idx: usize) -> String {
        self.loci
            .get(locus_idx)
            .cloned()
            .unwrap_or_else(|| format!("locus_{}", locus_idx + 1))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProfileStoreError::NotFound { path: path.to_path_buf() },
            _ => ProfileStoreError::Io(e),
        })?;
        let index: StoreIndex = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            if e.is_io() {
                ProfileStoreError::Io(e.into())
            } else {
                ProfileStoreError::corruption(format!("index {} unparsable: {}", path.display(), e))
            }
        })?;
        index.validate()?;
        debug!(
            "Loaded index {} ({} samples, {} loci, {}).",
            path.display(),
            index.samples.len(),
            index.num_loci(),
            index.dtype
        );
        Ok(index)
    }

    /// Writes the index next to `path` under a temporary name, then renames it over
    /// `path`.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let temp_index = tempfile::Builder::new()
            .prefix(".profiles_index.")
            .suffix(".json.tmp")
            .tempfile_in(parent_dir)?;
        self.write_to(temp_index)?.persist(path).map_err(|e| ProfileStoreError::Io(e.error))?;
        debug!("Wrote index {} ({} samples).", path.display(), self.samples.len());
        Ok(())
    }

    fn write_to(&self, temp_index: NamedTempFile) -> Result<NamedTempFile> {
        let mut writer = BufWriter::new(temp_index);
        serde_json::to_writer(&mut writer, self).map_err(|e| ProfileStoreError::Io(e.into()))?;
        writer.flush()?;
        let temp_index = writer.into_inner().map_err(|e| ProfileStoreError::Io(e.into_error()))?;
        temp_index.as_file().sync_all()?;
        Ok(temp_index)
    }
}
