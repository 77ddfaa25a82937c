// matrix.rs
//
// Dense row-major matrix of allele codes, persisted as a NumPy `.npy` file so
// stores stay readable by the numpy tooling that produced earlier references.
// Files are memory-mapped; blocks are sliced out of the mapping on demand.

use crate::encoding::LocusMapping;
use crate::error::{ProfileStoreError, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memmap2::{Mmap, MmapMut};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Ix2, Zip};
use ndarray_npy::{write_zeroed_npy, ViewElement, ViewMutElement, ViewMutNpyExt, ViewNpyExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
/// Largest header dict accepted from a file. numpy itself refuses anything
/// above 10000 bytes unless told otherwise.
const MAX_NPY_HEADER_LEN: usize = 1 << 16;

// --- Element Width ---

/// Width of one stored allele code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementWidth {
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
}

impl ElementWidth {
    pub fn bytes(self) -> usize {
        match self {
            ElementWidth::U16 => 2,
            ElementWidth::U32 => 4,
        }
    }

    pub fn max_code(self) -> u32 {
        match self {
            ElementWidth::U16 => u16::MAX as u32,
            ElementWidth::U32 => u32::MAX,
        }
    }

    /// Narrowest width able to hold `max_code`.
    pub fn for_max_code(max_code: u32) -> Self {
        if max_code <= u16::MAX as u32 {
            ElementWidth::U16
        } else {
            ElementWidth::U32
        }
    }

    /// Narrowest width holding every code bound in `mappings`.
    pub fn for_mappings(mappings: &[LocusMapping]) -> Self {
        let largest_code = mappings.iter().map(LocusMapping::max_code).max().unwrap_or(0);
        Self::for_max_code(largest_code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementWidth::U16 => "uint16",
            ElementWidth::U32 => "uint32",
        }
    }
}

impl fmt::Display for ElementWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementWidth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uint16" | "u16" => Ok(ElementWidth::U16),
            "uint32" | "u32" => Ok(ElementWidth::U32),
            other => Err(format!("unsupported element width '{}' (expected uint16 or uint32)", other)),
        }
    }
}

// --- Header ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixHeader {
    pub width: ElementWidth,
    pub num_rows: usize,
    pub num_cols: usize,
}

impl MatrixHeader {
    pub fn new(width: ElementWidth, num_rows: usize, num_cols: usize) -> Self {
        Self { width, num_rows, num_cols }
    }

    /// Works out width and shape from a mapped `.npy` file. Anything that is not
    /// a complete 2-d `<u2`/`<u4` matrix comes back as the reason string.
    fn from_npy_bytes(npy_bytes: &[u8]) -> std::result::Result<Self, String> {
        check_header_len(npy_bytes)?;
        let narrow_error = match ArrayView2::<u16>::view_npy(npy_bytes) {
            Ok(view) => return Ok(Self::new(ElementWidth::U16, view.nrows(), view.ncols())),
            Err(e) => e,
        };
        match ArrayView2::<u32>::view_npy(npy_bytes) {
            Ok(view) => Ok(Self::new(ElementWidth::U32, view.nrows(), view.ncols())),
            Err(wide_error) => Err(format!(
                "not a 2-d uint16 ({}) or uint32 ({}) matrix",
                narrow_error, wide_error
            )),
        }
    }
}

/// Checks the magic and the declared header length before the npy parser sees
/// the header, since the parser allocates whatever length the file claims.
fn check_header_len(npy_bytes: &[u8]) -> std::result::Result<(), String> {
    if npy_bytes.len() < 10 || &npy_bytes[..6] != NPY_MAGIC {
        return Err("file does not start with the .npy magic".to_string());
    }
    let (header_len, preamble_len) = match npy_bytes[6] {
        1 => (LittleEndian::read_u16(&npy_bytes[8..10]) as usize, 10),
        2 | 3 if npy_bytes.len() >= 12 => (LittleEndian::read_u32(&npy_bytes[8..12]) as usize, 12),
        2 | 3 => return Err("truncated .npy preamble".to_string()),
        major_version => return Err(format!("unsupported .npy format version {}", major_version)),
    };
    if header_len > MAX_NPY_HEADER_LEN {
        return Err(format!(
            "header length {} exceeds the {} byte limit",
            header_len, MAX_NPY_HEADER_LEN
        ));
    }
    if preamble_len + header_len > npy_bytes.len() {
        return Err(format!(
            "header declares {} bytes but the file holds {}",
            preamble_len + header_len,
            npy_bytes.len()
        ));
    }
    Ok(())
}

// --- Block Access ---

/// Random access to contiguous row blocks of a profile matrix, widened to u32.
pub trait ProfileBlockAccessor: Sync {
    /// Rows `[start_row, start_row + num_rows)` as a (num_rows x num_loci) array.
    fn read_block(&self, start_row: usize, num_rows: usize) -> Result<Array2<u32>>;

    fn num_profiles(&self) -> usize;
    fn num_loci(&self) -> usize;
}

/// Splits `total_rows` into `(start, len)` ranges of at most `block_size` rows.
pub fn block_ranges(total_rows: usize, block_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = block_size.max(1);
    (0..total_rows)
        .step_by(step)
        .map(move |start| (start, step.min(total_rows - start)))
}

fn check_block_bounds(start_row: usize, num_rows: usize, total_rows: usize) -> Result<()> {
    if start_row + num_rows > total_rows {
        return Err(ProfileStoreError::invalid_input(format!(
            "block [{}, {}) exceeds matrix with {} rows",
            start_row,
            start_row + num_rows,
            total_rows
        )));
    }
    Ok(())
}

/// An on-disk matrix, mapped read-only. Clones share the mapping, so the
/// accessor can be handed to every worker thread.
#[derive(Debug, Clone)]
pub struct MatrixFile {
    path: PathBuf,
    header: MatrixHeader,
    mapping: Arc<Mmap>,
}

impl MatrixFile {
    /// Maps the file and validates its header, including that the data section
    /// is exactly as long as the shape requires.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProfileStoreError::NotFound { path: path.to_path_buf() },
            _ => ProfileStoreError::Io(e),
        })?;
        if file.metadata()?.len() == 0 {
            return Err(ProfileStoreError::corruption(format!("matrix {} is empty", path.display())));
        }
        let mapping = unsafe { Mmap::map(&file)? };
        let header = MatrixHeader::from_npy_bytes(&mapping).map_err(|reason| {
            ProfileStoreError::corruption(format!("matrix {} unreadable: {}", path.display(), reason))
        })?;
        debug!(
            "Mapped matrix {} ({} x {}, {}).",
            path.display(),
            header.num_rows,
            header.num_cols,
            header.width
        );
        Ok(Self { path: path.to_path_buf(), header, mapping: Arc::new(mapping) })
    }

    pub fn header(&self) -> &MatrixHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn widen_rows<A>(npy_bytes: &[u8], start_row: usize, num_rows: usize) -> Result<Array2<u32>>
where
    A: ViewElement + Copy + Into<u32>,
{
    let view = ArrayView2::<A>::view_npy(npy_bytes)
        .map_err(|e| ProfileStoreError::corruption(format!("matrix view failed: {}", e)))?;
    Ok(view
        .slice(s![start_row..start_row + num_rows, ..])
        .mapv(|code: A| -> u32 { code.into() }))
}

impl ProfileBlockAccessor for MatrixFile {
    fn read_block(&self, start_row: usize, num_rows: usize) -> Result<Array2<u32>> {
        check_block_bounds(start_row, num_rows, self.header.num_rows)?;
        match self.header.width {
            ElementWidth::U16 => widen_rows::<u16>(&self.mapping, start_row, num_rows),
            ElementWidth::U32 => widen_rows::<u32>(&self.mapping, start_row, num_rows),
        }
    }

    fn num_profiles(&self) -> usize {
        self.header.num_rows
    }

    fn num_loci(&self) -> usize {
        self.header.num_cols
    }
}

impl ProfileBlockAccessor for Array2<u32> {
    fn read_block(&self, start_row: usize, num_rows: usize) -> Result<Array2<u32>> {
        check_block_bounds(start_row, num_rows, self.nrows())?;
        Ok(self.slice(s![start_row..start_row + num_rows, ..]).to_owned())
    }

    fn num_profiles(&self) -> usize {
        self.nrows()
    }

    fn num_loci(&self) -> usize {
        self.ncols()
    }
}

// --- Writer ---

/// Fills a `.npy` matrix whose shape is fixed up front. The file is sized and
/// zero-filled on creation; blocks are then written through a writable mapping.
pub struct MatrixWriter {
    mapping: MmapMut,
    header: MatrixHeader,
    rows_written: usize,
}

impl MatrixWriter {
    pub fn create(file: &File, header: MatrixHeader) -> Result<Self> {
        let shape = Ix2(header.num_rows, header.num_cols);
        let allocated = match header.width {
            ElementWidth::U16 => write_zeroed_npy::<u16, _>(file, shape),
            ElementWidth::U32 => write_zeroed_npy::<u32, _>(file, shape),
        };
        allocated.map_err(|e| {
            ProfileStoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("could not allocate {} x {} matrix: {}", header.num_rows, header.num_cols, e),
            ))
        })?;
        let mapping = unsafe { MmapMut::map_mut(file)? };
        Ok(Self { mapping, header, rows_written: 0 })
    }

    pub fn write_block(&mut self, block: ArrayView2<u32>) -> Result<()> {
        if block.ncols() != self.header.num_cols {
            return Err(ProfileStoreError::invalid_input(format!(
                "block has {} codes per row, matrix has {} loci",
                block.ncols(),
                self.header.num_cols
            )));
        }
        if self.rows_written + block.nrows() > self.header.num_rows {
            return Err(ProfileStoreError::invalid_input(format!(
                "matrix declared {} rows, refusing to write past them",
                self.header.num_rows
            )));
        }
        let width_max = self.header.width.max_code();
        if let Some(code) = block.iter().find(|&&code| code > width_max) {
            return Err(ProfileStoreError::invalid_input(format!(
                "allele code {} does not fit in {}",
                code, self.header.width
            )));
        }
        let start_row = self.rows_written;
        match self.header.width {
            ElementWidth::U16 => narrow_rows(&mut self.mapping, start_row, block, |code| code as u16)?,
            ElementWidth::U32 => narrow_rows(&mut self.mapping, start_row, block, |code| code)?,
        }
        self.rows_written += block.nrows();
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Flushes the mapping. Fails if fewer rows than declared were written.
    pub fn finish(self) -> Result<()> {
        if self.rows_written != self.header.num_rows {
            return Err(ProfileStoreError::invalid_input(format!(
                "matrix declared {} rows but {} were written",
                self.header.num_rows, self.rows_written
            )));
        }
        self.mapping.flush()?;
        Ok(())
    }
}

fn narrow_rows<A, F>(npy_bytes: &mut [u8], start_row: usize, block: ArrayView2<u32>, narrow: F) -> Result<()>
where
    A: ViewMutElement,
    F: Fn(u32) -> A,
{
    let mut view = ArrayViewMut2::<A>::view_mut_npy(npy_bytes)
        .map_err(|e| ProfileStoreError::corruption(format!("matrix view failed: {}", e)))?;
    let mut target_rows = view.slice_mut(s![start_row..start_row + block.nrows(), ..]);
    Zip::from(&mut target_rows)
        .and(&block)
        .for_each(|slot, &code| *slot = narrow(code));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn write_matrix(path: &Path, width: ElementWidth, rows: &Array2<u32>) {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let header = MatrixHeader::new(width, rows.nrows(), rows.ncols());
        let mut writer = MatrixWriter::create(&file, header).unwrap();
        writer.write_block(rows.view()).unwrap();
        writer.finish().unwrap();
    }

    fn npy_v1_bytes(dict_text: &str, total_header: usize, data: &[u8]) -> Vec<u8> {
        let header_len = total_header - 10;
        let mut raw = Vec::new();
        raw.extend_from_slice(NPY_MAGIC);
        raw.extend_from_slice(&[1, 0]);
        raw.extend_from_slice(&(header_len as u16).to_le_bytes());
        raw.extend_from_slice(dict_text.as_bytes());
        raw.extend(std::iter::repeat(b' ').take(header_len - dict_text.len() - 1));
        raw.push(b'\n');
        raw.extend_from_slice(data);
        raw
    }

    #[test]
    fn opens_matrix_written_by_numpy() {
        // byte layout numpy 1.x produces for np.arange(6, dtype=np.uint32).reshape(2, 3)
        let data: Vec<u8> = (0u32..6).flat_map(|v| v.to_le_bytes()).collect();
        let raw = npy_v1_bytes("{'descr': '<u4', 'fortran_order': False, 'shape': (2, 3), }", 128, &data);

        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("profiles.npy");
        std::fs::write(&path, &raw).unwrap();
        let matrix = MatrixFile::open(&path).unwrap();
        assert_eq!(*matrix.header(), MatrixHeader::new(ElementWidth::U32, 2, 3));
        assert_eq!(matrix.read_block(1, 1).unwrap(), array![[3u32, 4, 5]]);
    }

    #[test]
    fn written_header_is_numpy_compatible() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("profiles.npy");
        write_matrix(&path, ElementWidth::U16, &array![[1u32, 2], [3, 4]]);
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..6], NPY_MAGIC);
        let header_text = String::from_utf8_lossy(&raw[10..raw.len() - 8]).into_owned();
        assert!(header_text.contains("'descr': '<u2'"));
        assert!(header_text.contains("'fortran_order': False"));
        assert!(header_text.contains("(2, 2)"));
        assert_eq!(&raw[raw.len() - 8..], &[1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn rejects_foreign_files_and_dtypes() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let not_npy = scratch_dir.path().join("archive.npy");
        std::fs::write(&not_npy, b"PK\x03\x04 definitely not a matrix").unwrap();
        assert!(matches!(MatrixFile::open(&not_npy), Err(ProfileStoreError::Corruption(_))));

        let float_matrix = scratch_dir.path().join("float.npy");
        let raw = npy_v1_bytes(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (1, 1), }",
            128,
            &1.5f64.to_le_bytes(),
        );
        std::fs::write(&float_matrix, &raw).unwrap();
        assert!(matches!(MatrixFile::open(&float_matrix), Err(ProfileStoreError::Corruption(_))));

        let flat_matrix = scratch_dir.path().join("flat.npy");
        let raw = npy_v1_bytes("{'descr': '<u2', 'fortran_order': False, 'shape': (2,), }", 128, &[1, 0, 2, 0]);
        std::fs::write(&flat_matrix, &raw).unwrap();
        assert!(matches!(MatrixFile::open(&flat_matrix), Err(ProfileStoreError::Corruption(_))));

        let empty = scratch_dir.path().join("empty.npy");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(MatrixFile::open(&empty), Err(ProfileStoreError::Corruption(_))));
    }

    #[test]
    fn oversized_header_length_is_corruption() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("profiles.npy");
        let mut raw = Vec::new();
        raw.extend_from_slice(NPY_MAGIC);
        raw.extend_from_slice(&[2, 0]);
        raw.extend_from_slice(&0xFFFF_FF00u32.to_le_bytes());
        raw.extend_from_slice(b"{'descr': '<u2'");
        std::fs::write(&path, &raw).unwrap();
        match MatrixFile::open(&path) {
            Err(ProfileStoreError::Corruption(message)) => assert!(message.contains("limit")),
            other => panic!("expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn blocks_read_back_what_was_written() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("profiles.npy");
        let rows = Array2::from_shape_fn((10, 4), |(i, j)| match j {
            0 => i as u32,
            1 => i as u32 + 1,
            2 => 0,
            _ => 65_535,
        });
        write_matrix(&path, ElementWidth::U16, &rows);

        let matrix = MatrixFile::open(&path).unwrap();
        assert_eq!(matrix.num_profiles(), 10);
        assert_eq!(matrix.num_loci(), 4);
        let block = matrix.read_block(3, 4).unwrap();
        assert_eq!(block.dim(), (4, 4));
        assert_eq!(block.row(0).to_vec(), vec![3, 4, 0, 65_535]);
        assert_eq!(block.row(3).to_vec(), vec![6, 7, 0, 65_535]);
        assert!(matrix.read_block(8, 3).is_err());
    }

    #[test]
    fn wide_codes_need_u32() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("wide.npy");
        let file = tempfile::tempfile().unwrap();
        let mut narrow_writer = MatrixWriter::create(&file, MatrixHeader::new(ElementWidth::U16, 1, 1)).unwrap();
        assert!(narrow_writer.write_block(array![[70_000u32]].view()).is_err());
        assert_eq!(narrow_writer.rows_written(), 0);

        write_matrix(&path, ElementWidth::U32, &array![[70_000u32, 1]]);
        let matrix = MatrixFile::open(&path).unwrap();
        assert_eq!(matrix.read_block(0, 1).unwrap(), array![[70_000u32, 1]]);
        assert_eq!(ElementWidth::for_max_code(70_000), ElementWidth::U32);
        assert_eq!(ElementWidth::for_max_code(65_535), ElementWidth::U16);
    }

    #[test]
    fn truncated_file_is_corruption() {
        let scratch_dir = tempfile::tempdir().unwrap();
        let path = scratch_dir.path().join("profiles.npy");
        write_matrix(&path, ElementWidth::U16, &array![[1u32, 2], [3, 4]]);
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 2).unwrap();
        assert!(matches!(MatrixFile::open(&path), Err(ProfileStoreError::Corruption(_))));
    }

    #[test]
    fn writer_enforces_declared_shape() {
        let file = tempfile::tempfile().unwrap();
        let mut writer = MatrixWriter::create(&file, MatrixHeader::new(ElementWidth::U16, 2, 2)).unwrap();
        writer.write_block(array![[1u32, 2]].view()).unwrap();
        assert!(writer.write_block(array![[1u32]].view()).is_err());
        assert!(writer.write_block(array![[1u32, 2], [3, 4]].view()).is_err());
        assert!(writer.finish().is_err());
    }

    #[test]
    fn block_ranges_cover_all_rows() {
        let ranges: Vec<(usize, usize)> = block_ranges(10, 4).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(block_ranges(0, 4).count(), 0);
        assert_eq!(block_ranges(3, 1).count(), 3);
    }
}
