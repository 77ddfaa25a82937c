// distance.rs
//
// Blocked near-neighbor scan of query profiles against a stored matrix.

use crate::config::CompareOptions;
use crate::encoding::{encode_row, is_missing_allele, LocusMapping, MISSING_CODE};
use crate::error::{ProfileStoreError, Result};
use crate::matrix::{block_ranges, ProfileBlockAccessor};
use crate::source::RawProfile;
use log::{debug, info};
use ndarray::{ArrayView1, Zip};
use rayon::prelude::*;

/// One query/reference pair within the distance threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub query_id: String,
    pub ref_id: String,
    pub diffs: u32,
    pub compared_loci: u32,
    pub pct_diff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileDistance {
    pub diffs: u32,
    pub compared_loci: u32,
}

impl ProfileDistance {
    /// Share of compared loci that differ, in percent.
    pub fn pct_diff(&self) -> f64 {
        if self.compared_loci == 0 {
            return 0.0;
        }
        self.diffs as f64 / self.compared_loci as f64 * 100.0
    }
}

/// Hamming-style distance over loci called in both profiles. A locus where
/// either side is missing counts toward neither total.
pub fn profile_distance(a: ArrayView1<u32>, b: ArrayView1<u32>) -> ProfileDistance {
    let mut distance = ProfileDistance::default();
    Zip::from(&a).and(&b).for_each(|&code_a, &code_b| {
        if code_a != MISSING_CODE && code_b != MISSING_CODE {
            distance.compared_loci += 1;
            if code_a != code_b {
                distance.diffs += 1;
            }
        }
    });
    distance
}

/// Rejects a zero block size and a sample list that does not cover the matrix.
pub fn check_scan_inputs<A>(ref_samples: &[String], accessor: &A, options: &CompareOptions) -> Result<()>
where
    A: ProfileBlockAccessor + ?Sized,
{
    if options.block_size == 0 {
        return Err(ProfileStoreError::invalid_input("block size must be at least 1"));
    }
    if ref_samples.len() != accessor.num_profiles() {
        return Err(ProfileStoreError::corruption(format!(
            "{} reference sample ids for {} matrix rows",
            ref_samples.len(),
            accessor.num_profiles()
        )));
    }
    Ok(())
}

/// Streams every (query, reference) pair with `compared_loci > 0` and
/// `diffs <= threshold` into `sink`, in query order, then reference row order.
///
/// Queries are encoded against `mappings` without extending them; alleles the
/// store has never seen are treated as missing. The reference matrix is read
/// `block_size` rows at a time, so peak memory stays proportional to one block.
pub fn compare<A, F>(
    queries: &[RawProfile],
    mappings: &[LocusMapping],
    ref_samples: &[String],
    accessor: &A,
    options: &CompareOptions,
    mut sink: F,
) -> Result<usize>
where
    A: ProfileBlockAccessor + ?Sized,
    F: FnMut(MatchRecord) -> Result<()>,
{
    check_scan_inputs(ref_samples, accessor, options)?;

    let mut emitted_records = 0usize;
    for query in queries {
        emitted_records += compare_query(query, mappings, ref_samples, accessor, options, &mut sink)?;
    }
    info!(
        "Compared {} queries against {} reference profiles; {} pair(s) within {} differences.",
        queries.len(),
        accessor.num_profiles(),
        emitted_records,
        options.threshold
    );
    Ok(emitted_records)
}

/// Scores one query against every reference row, block by block. Callers
/// should run [`check_scan_inputs`] once beforehand.
pub fn compare_query<A, F>(
    query: &RawProfile,
    mappings: &[LocusMapping],
    ref_samples: &[String],
    accessor: &A,
    options: &CompareOptions,
    sink: &mut F,
) -> Result<usize>
where
    A: ProfileBlockAccessor + ?Sized,
    F: FnMut(MatchRecord) -> Result<()>,
{
    let encoded_query = encode_row(&query.alleles, mappings);
    if encoded_query.had_unknown_allele {
        let unknown_alleles = query
            .alleles
            .iter()
            .zip(mappings.iter())
            .filter(|(allele, locus_mapping)| !is_missing_allele(allele) && locus_mapping.code_of(allele.trim()).is_none())
            .count();
        debug!(
            "Query {} has {} allele(s) unknown to the reference; treating them as missing.",
            query.sample_id, unknown_alleles
        );
    }
    let query_codes = ArrayView1::from(encoded_query.codes.as_slice());

    let mut emitted_records = 0usize;
    for (block_start, block_len) in block_ranges(accessor.num_profiles(), options.block_size) {
        let block = accessor.read_block(block_start, block_len)?;
        let block_distances: Vec<ProfileDistance> = (0..block.nrows())
            .into_par_iter()
            .map(|row_in_block| profile_distance(query_codes, block.row(row_in_block)))
            .collect();

        for (row_in_block, distance) in block_distances.into_iter().enumerate() {
            if distance.compared_loci == 0 || distance.diffs > options.threshold {
                continue;
            }
            let ref_id = ref_samples.get(block_start + row_in_block).cloned().ok_or_else(|| {
                ProfileStoreError::corruption(format!("no sample id for reference row {}", block_start + row_in_block))
            })?;
            sink(MatchRecord {
                query_id: query.sample_id.clone(),
                ref_id,
                diffs: distance.diffs,
                compared_loci: distance.compared_loci,
                pct_diff: distance.pct_diff(),
            })?;
            emitted_records += 1;
        }
    }
    Ok(emitted_records)
}

/// [`compare`] collecting its output.
pub fn compare_to_vec<A>(
    queries: &[RawProfile],
    mappings: &[LocusMapping],
    ref_samples: &[String],
    accessor: &A,
    options: &CompareOptions,
) -> Result<Vec<MatchRecord>>
where
    A: ProfileBlockAccessor + ?Sized,
{
    let mut records = Vec::new();
    compare(queries, mappings, ref_samples, accessor, options, |record| {
        records.push(record);
        Ok(())
    })?;
    Ok(records)
}
