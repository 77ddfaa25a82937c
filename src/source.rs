// source.rs
//
// Row sources feeding the store: anything that can hand out a locus header and
// (sample id, allele strings) records in a stable order.

use crate::error::{ProfileStoreError, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// One sample's raw allele calls, in locus order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProfile {
    pub sample_id: String,
    pub alleles: Vec<String>,
}

impl RawProfile {
    pub fn new<S: Into<String>, A: AsRef<str>>(sample_id: S, alleles: &[A]) -> Self {
        Self {
            sample_id: sample_id.into(),
            alleles: alleles.iter().map(|allele| allele.as_ref().to_string()).collect(),
        }
    }
}

pub trait ProfileSource {
    /// Locus names in column order.
    fn loci(&self) -> &[String];

    /// Next record, or `None` once the source is exhausted.
    fn next_profile(&mut self) -> Result<Option<RawProfile>>;

    /// Human readable origin, used in log messages.
    fn describe(&self) -> String;

    fn read_all(&mut self) -> Result<Vec<RawProfile>> {
        let mut profiles = Vec::new();
        while let Some(profile) = self.next_profile()? {
            profiles.push(profile);
        }
        Ok(profiles)
    }
}

// --- In-memory source ---

/// Source over rows already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    origin: Option<String>,
    loci: Vec<String>,
    profiles: std::collections::VecDeque<RawProfile>,
}

impl InMemorySource {
    pub fn new(loci: Vec<String>, profiles: Vec<RawProfile>) -> Self {
        Self { origin: None, loci, profiles: profiles.into() }
    }

    /// Reads `source` to the end, keeping its header and description.
    pub fn drain_from<S: ProfileSource + ?Sized>(source: &mut S) -> Result<Self> {
        let profiles = source.read_all()?;
        Ok(Self {
            origin: Some(source.describe()),
            loci: source.loci().to_vec(),
            profiles: profiles.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileSource for InMemorySource {
    fn loci(&self) -> &[String] {
        &self.loci
    }

    fn next_profile(&mut self) -> Result<Option<RawProfile>> {
        Ok(self.profiles.pop_front())
    }

    fn describe(&self) -> String {
        match &self.origin {
            Some(origin) => origin.clone(),
            None => format!("in-memory rows ({} remaining)", self.profiles.len()),
        }
    }
}

// --- TSV source ---

/// Tab-separated profile table: a header row (first column is the sample id
/// column, the rest are locus names) followed by one row per sample.
pub struct TsvProfileSource {
    path: PathBuf,
    loci: Vec<String>,
    reader: csv::Reader<File>,
    record: csv::StringRecord,
    rows_read: usize,
}

impl TsvProfileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProfileStoreError::NotFound { path: path.to_path_buf() },
            _ => ProfileStoreError::Io(e),
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .from_reader(file);
        let loci: Vec<String> = reader
            .headers()
            .map_err(|e| tsv_error(path, e))?
            .iter()
            .skip(1)
            .map(|locus| locus.trim().to_string())
            .collect();
        debug!("Opened profile table {} with {} loci.", path.display(), loci.len());
        Ok(Self {
            path: path.to_path_buf(),
            loci,
            reader,
            record: csv::StringRecord::new(),
            rows_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tsv_error(path: &Path, e: csv::Error) -> ProfileStoreError {
    ProfileStoreError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {}", path.display(), e),
    ))
}

impl ProfileSource for TsvProfileSource {
    fn loci(&self) -> &[String] {
        &self.loci
    }

    fn next_profile(&mut self) -> Result<Option<RawProfile>> {
        loop {
            let has_record = self
                .reader
                .read_record(&mut self.record)
                .map_err(|e| tsv_error(&self.path, e))?;
            if !has_record {
                debug!("Read {} profiles from {}.", self.rows_read, self.path.display());
                return Ok(None);
            }
            let mut fields = self.record.iter();
            let sample_id = match fields.next().map(str::trim) {
                Some(sample_id) if !sample_id.is_empty() || self.record.len() > 1 => sample_id.to_string(),
                _ => continue,
            };
            let alleles = fields.map(|allele| allele.trim().to_string()).collect();
            self.rows_read += 1;
            return Ok(Some(RawProfile { sample_id, alleles }));
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Expands directories to the `*.tsv` files they contain (sorted by name) and
/// keeps explicit file paths as given. A final path component holding `*` or
/// `?` is matched against the files of its parent directory.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut input_files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let tsv_files = sorted_files_in(input, |file_name| file_name.ends_with(".tsv"))?;
            debug!("Found {} TSV file(s) in {}.", tsv_files.len(), input.display());
            input_files.extend(tsv_files);
        } else if input.is_file() {
            input_files.push(input.clone());
        } else if let Some(pattern) = wildcard_pattern(input) {
            let parent = match input.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            if !parent.is_dir() {
                return Err(ProfileStoreError::NotFound { path: input.clone() });
            }
            let matched_files = sorted_files_in(parent, |file_name| wildcard_matches(pattern, file_name))?;
            if matched_files.is_empty() {
                return Err(ProfileStoreError::NotFound { path: input.clone() });
            }
            debug!("Pattern {} matched {} file(s).", input.display(), matched_files.len());
            input_files.extend(matched_files);
        } else {
            return Err(ProfileStoreError::NotFound { path: input.clone() });
        }
    }
    info!("Collected {} input profile table(s).", input_files.len());
    Ok(input_files)
}

fn sorted_files_in<F: Fn(&str) -> bool>(dir: &Path, keep: F) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.file_name().and_then(|name| name.to_str()).map_or(false, &keep))
        .collect();
    files.sort();
    Ok(files)
}

fn wildcard_pattern(input: &Path) -> Option<&str> {
    input
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| name.contains(['*', '?']))
}

/// Shell-style match where `*` spans any run of characters and `?` exactly one.
fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut last_star: Option<(usize, usize)> = None;
    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                last_star = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match last_star {
                Some((star_p, star_n)) => {
                    p = star_p + 1;
                    n = star_n + 1;
                    last_star = Some((star_p, star_n + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
