// encoding.rs
//
// Per-locus allele string -> integer codes. Code 0 is the missing sentinel and
// is never bound to a real allele.

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};

/// Code stored for a missing or uncallable allele.
pub const MISSING_CODE: u32 = 0;

/// Returns true when an allele call denotes "no determination".
///
/// Both the empty string and the literal "0" are treated as missing, matching the
/// convention of the chewBBACA/JASEN profile tables this store is fed from. A real
/// allele called "0" therefore cannot be represented.
#[inline(always)]
pub fn is_missing_allele(allele: &str) -> bool {
    let trimmed_allele = allele.trim();
    trimmed_allele.is_empty() || trimmed_allele == "0"
}

/// Insertion-ordered mapping for a single locus. Serialized as a JSON object whose
/// key order is the order in which alleles were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocusMapping {
    codes_by_allele: IndexMap<String, u32>,
}

impl LocusMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `allele` to the next unused code if it has not been seen. Returns its code.
    /// Codes handed out here are dense, so the next one is always `len + 1`.
    fn intern(&mut self, allele: &str) -> u32 {
        if let Some(&existing_code) = self.codes_by_allele.get(allele) {
            return existing_code;
        }
        let next_code = self.codes_by_allele.len() as u32 + 1;
        self.codes_by_allele.insert(allele.to_string(), next_code);
        next_code
    }

    pub fn code_of(&self, allele: &str) -> Option<u32> {
        self.codes_by_allele.get(allele).copied()
    }

    /// Reverse lookup. Linear in the number of alleles of the locus.
    pub fn decode(&self, code: u32) -> Option<&str> {
        if code == MISSING_CODE {
            return None;
        }
        self.codes_by_allele
            .iter()
            .find(|(_, &bound_code)| bound_code == code)
            .map(|(allele, _)| allele.as_str())
    }

    pub fn max_code(&self) -> u32 {
        self.codes_by_allele.values().copied().max().unwrap_or(MISSING_CODE)
    }

    pub fn len(&self) -> usize {
        self.codes_by_allele.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes_by_allele.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.codes_by_allele
            .iter()
            .map(|(allele, &code)| (allele.as_str(), code))
    }
}

/// Builds one mapping per locus by scanning `rows` in order.
///
/// `num_loci` fixes the number of mappings; values beyond it are ignored and short
/// rows simply contribute nothing for their absent positions.
pub fn build_mappings<'a, I, S>(rows: I, num_loci: usize) -> Vec<LocusMapping>
where
    I: IntoIterator<Item = &'a [S]>,
    S: AsRef<str> + 'a,
{
    let mut locus_mappings: Vec<LocusMapping> = vec![LocusMapping::new(); num_loci];
    let mut rows_scanned = 0usize;
    for row in rows {
        for (locus_idx, allele) in row.iter().take(num_loci).enumerate() {
            let allele_str = allele.as_ref().trim();
            if is_missing_allele(allele_str) {
                continue;
            }
            locus_mappings[locus_idx].intern(allele_str);
        }
        rows_scanned += 1;
    }
    debug!(
        "Built allele mappings for {} loci from {} rows (largest code: {}).",
        num_loci,
        rows_scanned,
        locus_mappings.iter().map(LocusMapping::max_code).max().unwrap_or(0)
    );
    locus_mappings
}

/// Result of encoding one raw row against fixed mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRow {
    pub codes: Vec<u32>,
    pub had_unknown_allele: bool,
    /// Locus index of the first allele that had no code, if any.
    pub first_unknown_locus: Option<usize>,
}

/// Encodes `row` against `mappings` without ever extending them. Unknown alleles
/// become [`MISSING_CODE`] and raise `had_unknown_allele`.
pub fn encode_row<S: AsRef<str>>(row: &[S], mappings: &[LocusMapping]) -> EncodedRow {
    let mut codes = vec![MISSING_CODE; mappings.len()];
    let mut first_unknown_locus = None;
    for (locus_idx, locus_mapping) in mappings.iter().enumerate() {
        let allele_str = match row.get(locus_idx) {
            Some(allele) => allele.as_ref().trim(),
            None => continue,
        };
        if is_missing_allele(allele_str) {
            continue;
        }
        match locus_mapping.code_of(allele_str) {
            Some(code) => codes[locus_idx] = code,
            None => {
                first_unknown_locus.get_or_insert(locus_idx);
            }
        }
    }
    EncodedRow {
        codes,
        had_unknown_allele: first_unknown_locus.is_some(),
        first_unknown_locus,
    }
}

/// Turns codes back into allele strings; missing positions become "".
pub fn decode_row(codes: &[u32], mappings: &[LocusMapping]) -> Vec<String> {
    codes
        .iter()
        .zip(mappings.iter())
        .map(|(&code, locus_mapping)| locus_mapping.decode(code).unwrap_or("").to_string())
        .collect()
}
