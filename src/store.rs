// store.rs
//
// A profile store directory: `profiles.npy` (the encoded matrix) plus
// `profiles_index.json`. Every file replacement goes through a temporary file in
// the same directory followed by a rename, so the canonical paths only ever hold
// complete versions.

use crate::config::DEFAULT_BLOCK_SIZE;
use crate::encoding::{build_mappings, decode_row, encode_row, LocusMapping};
use crate::error::{ProfileStoreError, Result};
use crate::index::StoreIndex;
use crate::matrix::{block_ranges, ElementWidth, MatrixFile, MatrixHeader, MatrixWriter, ProfileBlockAccessor};
use crate::source::{ProfileSource, RawProfile};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const MATRIX_FILE_NAME: &str = "profiles.npy";
pub const INDEX_FILE_NAME: &str = "profiles_index.json";

pub fn matrix_path(store_dir: &Path) -> PathBuf {
    store_dir.join(MATRIX_FILE_NAME)
}

pub fn index_path(store_dir: &Path) -> PathBuf {
    store_dir.join(INDEX_FILE_NAME)
}

fn temp_matrix_in(store_dir: &Path) -> Result<NamedTempFile> {
    Ok(tempfile::Builder::new()
        .prefix(".profiles.")
        .suffix(".npy.tmp")
        .tempfile_in(store_dir)?)
}

/// Flushes the finished temp matrix to disk and renames it over the canonical path.
fn persist_matrix(temp_matrix: NamedTempFile, store_dir: &Path) -> Result<()> {
    temp_matrix.as_file().sync_all()?;
    let canonical_path = matrix_path(store_dir);
    temp_matrix
        .persist(&canonical_path)
        .map_err(|e| ProfileStoreError::Io(e.error))?;
    debug!("Renamed new matrix into place at {}.", canonical_path.display());
    Ok(())
}

/// Handle on an opened store. Only the index is held in memory; matrix rows are
/// read block by block on demand.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
    index: StoreIndex,
    matrix: MatrixFile,
}

impl ProfileStore {
    /// Writes a fresh store from `rows`. Alleles absent from `mappings` are stored
    /// as missing. `width` is widened when the mappings need it.
    pub fn create(
        store_dir: &Path,
        loci: Vec<String>,
        rows: &[RawProfile],
        mappings: Vec<LocusMapping>,
        width: ElementWidth,
    ) -> Result<Self> {
        let num_loci = mappings.len();
        if !loci.is_empty() && loci.len() != num_loci {
            return Err(ProfileStoreError::invalid_input(format!(
                "{} locus names given for {} locus mappings",
                loci.len(),
                num_loci
            )));
        }
        fs::create_dir_all(store_dir)?;

        let required_width = ElementWidth::for_mappings(&mappings);
        let effective_width = width.max(required_width);
        if effective_width != width {
            info!(
                "Largest allele code does not fit in {}; storing the matrix as {} instead.",
                width, effective_width
            );
        }

        let header = MatrixHeader::new(effective_width, rows.len(), num_loci);
        let temp_matrix = temp_matrix_in(store_dir)?;
        let mut matrix_writer = MatrixWriter::create(temp_matrix.as_file(), header)?;
        let mut rows_with_unknown_alleles = 0usize;
        for (block_start, block_len) in block_ranges(rows.len(), DEFAULT_BLOCK_SIZE) {
            let mut block = Array2::<u32>::zeros((block_len, num_loci));
            for (raw_profile, mut block_row) in rows[block_start..block_start + block_len].iter().zip(block.rows_mut()) {
                let encoded = encode_row(&raw_profile.alleles, &mappings);
                if encoded.had_unknown_allele {
                    rows_with_unknown_alleles += 1;
                }
                block_row.assign(&ArrayView1::from(encoded.codes.as_slice()));
            }
            matrix_writer.write_block(block.view())?;
        }
        if rows_with_unknown_alleles > 0 {
            warn!(
                "{} row(s) carried alleles without a code; those positions were stored as missing.",
                rows_with_unknown_alleles
            );
        }
        matrix_writer.finish()?;
        persist_matrix(temp_matrix, store_dir)?;

        let samples = rows.iter().map(|raw_profile| raw_profile.sample_id.clone()).collect();
        let index = StoreIndex::new(samples, loci, effective_width, mappings);
        index.save_atomic(&index_path(store_dir))?;

        let matrix = MatrixFile::open(&matrix_path(store_dir))?;
        info!(
            "Created profile store {} with {} profiles x {} loci ({}).",
            store_dir.display(),
            index.num_profiles(),
            index.num_loci(),
            effective_width
        );
        Ok(Self { dir: store_dir.to_path_buf(), index, matrix })
    }

    /// Opens an existing store, checking that index and matrix header agree.
    pub fn open(store_dir: &Path) -> Result<Self> {
        let index = StoreIndex::load(&index_path(store_dir))?;
        let matrix = MatrixFile::open(&matrix_path(store_dir))?;
        index.validate_against(matrix.header())?;
        debug!(
            "Opened profile store {} ({} profiles, {} loci).",
            store_dir.display(),
            index.num_profiles(),
            index.num_loci()
        );
        Ok(Self { dir: store_dir.to_path_buf(), index, matrix })
    }

    /// Concatenates every source (source order, then row order), rebuilds the
    /// mappings from scratch over the union, and writes a fresh store.
    pub fn rebuild<S, I>(store_dir: &Path, sources: I, width: ElementWidth) -> Result<Self>
    where
        S: ProfileSource,
        I: IntoIterator<Item = S>,
    {
        let mut loci: Option<Vec<String>> = None;
        let mut all_rows: Vec<RawProfile> = Vec::new();
        for mut source in sources {
            let first_loci = loci.get_or_insert_with(|| source.loci().to_vec());
            if first_loci.as_slice() != source.loci() {
                warn!(
                    "Locus header of {} differs from the first input ({} vs {} loci); aligning its rows by position.",
                    source.describe(),
                    source.loci().len(),
                    first_loci.len()
                );
            }
            let rows_before = all_rows.len();
            all_rows.extend(source.read_all()?);
            info!("Read {} profiles from {}.", all_rows.len() - rows_before, source.describe());
        }

        if all_rows.is_empty() {
            return Err(ProfileStoreError::empty_input(format!("the inputs for {}", store_dir.display())));
        }
        let loci = loci.unwrap_or_default();
        let num_loci = if loci.is_empty() {
            all_rows.iter().map(|raw_profile| raw_profile.alleles.len()).max().unwrap_or(0)
        } else {
            loci.len()
        };
        let mappings = build_mappings(all_rows.iter().map(|raw_profile| raw_profile.alleles.as_slice()), num_loci);
        info!("Rebuilding {} from {} profiles over {} loci.", store_dir.display(), all_rows.len(), num_loci);
        Self::create(store_dir, loci, &all_rows, mappings, width)
    }

    /// Encodes `rows` against the stored mappings and writes the extended matrix
    /// into a temporary file. Nothing canonical changes until
    /// [`StagedAppend::commit`].
    pub fn stage_append(&self, rows: &[RawProfile]) -> Result<StagedAppend> {
        let mappings = &self.index.mappings;
        let mut encoded_rows = Vec::with_capacity(rows.len());
        let mut first_unknown: Option<(String, usize, String)> = None;
        let mut offending_rows = 0usize;
        for raw_profile in rows {
            let encoded = encode_row(&raw_profile.alleles, mappings);
            if let Some(locus_idx) = encoded.first_unknown_locus {
                offending_rows += 1;
                first_unknown.get_or_insert_with(|| {
                    let allele = raw_profile.alleles.get(locus_idx).map(|a| a.trim().to_string()).unwrap_or_default();
                    (raw_profile.sample_id.clone(), locus_idx, allele)
                });
            }
            encoded_rows.push(encoded.codes);
        }
        if let Some((sample, locus_idx, allele)) = first_unknown {
            warn!(
                "Append to {} rejected: {} incoming row(s) carry alleles missing from the stored mappings.",
                self.dir.display(),
                offending_rows
            );
            return Err(ProfileStoreError::UnknownAllele {
                sample,
                locus: self.index.locus_name(locus_idx),
                allele,
                offending_rows,
            });
        }

        let existing_rows = self.index.num_profiles();
        let num_loci = self.index.num_loci();
        let header = MatrixHeader::new(self.index.dtype, existing_rows + rows.len(), num_loci);
        let temp_matrix = temp_matrix_in(&self.dir)?;
        let mut matrix_writer = MatrixWriter::create(temp_matrix.as_file(), header)?;
        for (block_start, block_len) in block_ranges(existing_rows, DEFAULT_BLOCK_SIZE) {
            let block = self.matrix.read_block(block_start, block_len)?;
            matrix_writer.write_block(block.view())?;
        }
        let new_block = Array2::from_shape_vec((rows.len(), num_loci), encoded_rows.concat())
            .map_err(|e| ProfileStoreError::invalid_input(format!("incoming rows do not form a matrix: {}", e)))?;
        matrix_writer.write_block(new_block.view())?;
        matrix_writer.finish()?;
        temp_matrix.as_file().sync_all()?;

        let mut samples = self.index.samples.clone();
        samples.extend(rows.iter().map(|raw_profile| raw_profile.sample_id.clone()));
        let index = StoreIndex::new(samples, self.index.loci.clone(), self.index.dtype, mappings.clone());
        debug!(
            "Staged append of {} rows to {} in {}.",
            rows.len(),
            self.dir.display(),
            temp_matrix.path().display()
        );
        Ok(StagedAppend { dir: self.dir.clone(), temp_matrix, index })
    }

    /// Appends `rows` all-or-nothing. On error the store files are untouched.
    pub fn append(&mut self, rows: &[RawProfile]) -> Result<()> {
        if rows.is_empty() {
            info!("No profiles to append to {}.", self.dir.display());
            return Ok(());
        }
        *self = self.stage_append(rows)?.commit()?;
        info!(
            "Appended {} profiles to {} (now {}).",
            rows.len(),
            self.dir.display(),
            self.index.num_profiles()
        );
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &StoreIndex {
        &self.index
    }

    pub fn samples(&self) -> &[String] {
        &self.index.samples
    }

    pub fn loci(&self) -> &[String] {
        &self.index.loci
    }

    pub fn mappings(&self) -> &[LocusMapping] {
        &self.index.mappings
    }

    pub fn width(&self) -> ElementWidth {
        self.index.dtype
    }

    /// Allele strings of one stored row; missing positions come back as "".
    pub fn decoded_row(&self, row_idx: usize) -> Result<Vec<String>> {
        let block = self.read_block(row_idx, 1)?;
        Ok(decode_row(&block.row(0).to_vec(), &self.index.mappings))
    }
}

impl ProfileBlockAccessor for ProfileStore {
    fn read_block(&self, start_row: usize, num_rows: usize) -> Result<Array2<u32>> {
        self.matrix.read_block(start_row, num_rows)
    }

    fn num_profiles(&self) -> usize {
        self.index.num_profiles()
    }

    fn num_loci(&self) -> usize {
        self.index.num_loci()
    }
}

/// An append whose new matrix sits in a temporary file. Dropping it without
/// calling [`commit`](Self::commit) deletes that file.
#[derive(Debug)]
pub struct StagedAppend {
    dir: PathBuf,
    temp_matrix: NamedTempFile,
    index: StoreIndex,
}

impl StagedAppend {
    pub fn temp_path(&self) -> &Path {
        self.temp_matrix.path()
    }

    pub fn num_profiles(&self) -> usize {
        self.index.num_profiles()
    }

    /// Renames the staged matrix over the canonical one, then rewrites the index.
    pub fn commit(self) -> Result<ProfileStore> {
        let StagedAppend { dir, temp_matrix, index } = self;
        persist_matrix(temp_matrix, &dir)?;
        index.save_atomic(&index_path(&dir))?;
        let matrix = MatrixFile::open(&matrix_path(&dir))?;
        index.validate_against(matrix.header())?;
        Ok(ProfileStore { dir, index, matrix })
    }
}
