use crate::snvmeth::chrom::ChromIndex;
use crate::snvmeth::clustering::{ClusteringConfig, HierarchicalClustering, Linkage};
use crate::snvmeth::distance::{strand_indices, DistanceConfig, DistanceMatrix, DistanceMetric};
use crate::snvmeth::matrix::MatrixBuilder;
use crate::snvmeth::methylation::decode_read;
use crate::snvmeth::read::{FilterReason, FilteredRead, ReadFilter, Strand};
use crate::snvmeth::variant::SomaticSnv;
use crate::snvmeth::writers::RegionWriter;
use crate::utils::{fetch_overlapping_reads, Result, WorkerReaders};
use rust_htslib::bam;
use std::collections::HashSet;
use std::time::Instant;

/// Everything a worker needs to process one region, shared read-only.
#[derive(Debug, Clone)]
pub struct ProcessParams {
    pub window_size: i64,
    pub filter: ReadFilter,
    pub methyl_low: f64,
    pub methyl_high: f64,
    pub metrics: Vec<DistanceMetric>,
    pub distance: DistanceConfig,
    pub strand_matrices: bool,
    pub clustering: Option<ClusteringParams>,
    pub output_filtered_reads: bool,
    pub no_filter_verification: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusteringParams {
    pub linkage: Linkage,
    pub min_reads: usize,
    pub min_branch_length: f64,
}

/// Per-region outcome and statistics, collected in variant order.
#[derive(Debug, Clone, Default)]
pub struct RegionResult {
    pub region_id: usize,
    pub snv_id: usize,
    pub num_reads: usize,
    pub num_cpgs: usize,
    pub num_forward_reads: usize,
    pub num_reverse_reads: usize,
    pub num_filtered_reads: usize,
    pub valid_pairs: usize,
    pub invalid_pairs: usize,
    pub mean_common_coverage: f64,
    pub elapsed_ms: f64,
    pub success: bool,
    pub error_message: String,
}

/// Runs the full pipeline for one SNV region on the calling worker.
///
/// Failures are captured in the result record; only the current region is
/// aborted.
pub fn process_region(
    snv: &SomaticSnv,
    region_id: usize,
    readers: &mut WorkerReaders,
    chrom_index: &ChromIndex,
    params: &ProcessParams,
    writer: &RegionWriter,
) -> RegionResult {
    let mut result = RegionResult {
        region_id,
        snv_id: snv.snv_id,
        ..RegionResult::default()
    };
    let timer = Instant::now();

    match run_region(snv, region_id, readers, chrom_index, params, writer, &mut result) {
        Ok(()) => result.success = true,
        Err(message) => {
            result.success = false;
            result.error_message = message;
        }
    }

    result.elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
    result
}

#[allow(clippy::too_many_arguments)]
fn run_region(
    snv: &SomaticSnv,
    region_id: usize,
    readers: &mut WorkerReaders,
    chrom_index: &ChromIndex,
    params: &ProcessParams,
    writer: &RegionWriter,
    result: &mut RegionResult,
) -> Result<()> {
    let timer = Instant::now();
    let chr_name = chrom_index
        .name(snv.chr_id)
        .ok_or_else(|| format!("Unknown chromosome id {}", snv.chr_id))?
        .to_string();

    let chr_length = readers.chrom_length(&chr_name);
    if chr_length < 0 {
        return Err(format!(
            "Reference does not contain chromosome '{}'",
            chr_name
        ));
    }

    // Window around the variant, clamped to the chromosome (1-based inclusive)
    let region_start = (snv.pos - params.window_size).max(1);
    let region_end = (snv.pos + params.window_size).min(chr_length);

    let ref_start_0 = region_start - 1;
    let ref_seq = readers.fetch_reference(&chr_name, ref_start_0, region_end);
    if ref_seq.is_empty() {
        return Err(format!(
            "Failed to fetch reference sequence for {}:{}-{}",
            chr_name, region_start, region_end
        ));
    }

    let tumor_reads =
        fetch_overlapping_reads(&mut readers.tumor, &chr_name, ref_start_0, region_end)?;
    let normal_reads = match readers.normal.as_mut() {
        Some(normal) => fetch_overlapping_reads(normal, &chr_name, ref_start_0, region_end)?,
        None => Vec::new(),
    };

    let mut builder = MatrixBuilder::new(params.methyl_low, params.methyl_high);
    let mut filtered_reads: Vec<FilteredRead> = Vec::new();
    let mut seen_names: HashSet<String> = HashSet::new();

    // Tumor reads first so they win name collisions against the normal
    for (records, is_tumor) in [(&tumor_reads, true), (&normal_reads, false)] {
        for rec in records.iter() {
            append_read(
                rec,
                is_tumor,
                snv,
                &ref_seq,
                ref_start_0,
                params,
                &mut builder,
                &mut filtered_reads,
                &mut seen_names,
                result,
            )?;
        }
    }

    builder.finalize();
    let matrix = builder.matrix().expect("matrix was finalized");
    result.num_reads = matrix.n_reads;
    result.num_cpgs = matrix.n_sites;
    result.num_filtered_reads = filtered_reads.len();

    let region_dir = writer.region_dir(&chr_name, snv.pos, region_start, region_end)?;
    writer.write_reads(&region_dir, builder.reads(), &chr_name)?;
    writer.write_cpg_sites(&region_dir, &chr_name, &matrix.cpg_positions)?;
    writer.write_matrix(&region_dir, matrix)?;
    if params.strand_matrices {
        writer.write_strand_matrices(&region_dir, builder.reads(), matrix)?;
    }
    if params.output_filtered_reads && !filtered_reads.is_empty() {
        writer.write_filtered_reads(&region_dir, &chr_name, &filtered_reads)?;
    }

    if matrix.n_reads < 2 || matrix.n_sites < 1 {
        log::debug!(
            "Region {}: too small for distances ({} reads, {} sites)",
            region_id,
            matrix.n_reads,
            matrix.n_sites
        );
        return writer.write_metadata(
            &region_dir,
            snv,
            &chr_name,
            region_id,
            region_start,
            region_end,
            result,
            timer.elapsed().as_secs_f64() * 1000.0,
        );
    }

    let (forward_rows, reverse_rows) = strand_indices(builder.reads());

    for (metric_idx, &metric) in params.metrics.iter().enumerate() {
        let config = DistanceConfig {
            metric,
            ..params.distance
        };

        let all_dist = DistanceMatrix::compute(matrix, &config);
        if metric_idx == 0 {
            result.valid_pairs = all_dist.valid_pairs;
            result.invalid_pairs = all_dist.invalid_pairs;
            result.mean_common_coverage = all_dist.mean_common_coverage;
        }

        let strand_dists = if params.strand_matrices {
            let forward = if forward_rows.len() >= 2 {
                Some(DistanceMatrix::compute_subset(matrix, &forward_rows, &config))
            } else {
                None
            };
            let reverse = if reverse_rows.len() >= 2 {
                Some(DistanceMatrix::compute_subset(matrix, &reverse_rows, &config))
            } else {
                None
            };
            (forward, reverse)
        } else {
            (None, None)
        };

        writer.write_distance_matrix(&region_dir, &all_dist, None)?;
        writer.write_distance_stats(&region_dir, &all_dist)?;
        if let Some(forward) = &strand_dists.0 {
            writer.write_distance_matrix(&region_dir, forward, Some("forward"))?;
        }
        if let Some(reverse) = &strand_dists.1 {
            writer.write_distance_matrix(&region_dir, reverse, Some("reverse"))?;
        }

        log::debug!(
            "Region {}: distance matrix ({}) {}x{}, valid pairs: {}, mean coverage: {:.1}",
            region_id,
            metric,
            all_dist.size(),
            all_dist.size(),
            all_dist.valid_pairs,
            all_dist.mean_common_coverage
        );

        // Trees come from the first metric only; the others would repeat the
        // same topology modulo metric choice.
        if metric_idx > 0 {
            continue;
        }
        let clustering = match &params.clustering {
            Some(clustering) => clustering,
            None => continue,
        };
        if matrix.n_reads < clustering.min_reads {
            continue;
        }

        let clusterer = HierarchicalClustering::with_config(ClusteringConfig {
            method: clustering.linkage,
            min_branch_length: clustering.min_branch_length,
        });

        let labels = read_labels(builder.reads(), &all_dist.read_ids);
        let tree = clusterer.build_tree(&all_dist, &labels)?;
        if !tree.is_empty() {
            writer.write_clustering(&region_dir, &tree, "tree.nwk", true)?;
            log::debug!(
                "Region {}: clustering tree with {} leaves, method={}",
                region_id,
                tree.num_leaves(),
                clustering.linkage.name()
            );
        }

        if params.strand_matrices {
            for (dist, file_name) in [
                (&strand_dists.0, "tree_forward.nwk"),
                (&strand_dists.1, "tree_reverse.nwk"),
            ] {
                if let Some(dist) = dist {
                    let labels = read_labels(builder.reads(), &dist.read_ids);
                    let tree = clusterer.build_tree(dist, &labels)?;
                    if !tree.is_empty() {
                        writer.write_clustering(&region_dir, &tree, file_name, false)?;
                    }
                }
            }
        }
    }

    writer.write_metadata(
        &region_dir,
        snv,
        &chr_name,
        region_id,
        region_start,
        region_end,
        result,
        timer.elapsed().as_secs_f64() * 1000.0,
    )
}

#[allow(clippy::too_many_arguments)]
fn append_read(
    rec: &bam::Record,
    is_tumor: bool,
    snv: &SomaticSnv,
    ref_seq: &[u8],
    ref_start_0: i64,
    params: &ProcessParams,
    builder: &mut MatrixBuilder,
    filtered_reads: &mut Vec<FilteredRead>,
    seen_names: &mut HashSet<String>,
    result: &mut RegionResult,
) -> Result<()> {
    let filter = &params.filter;
    let (keep, reasons) = filter.classify(rec);

    if !keep && !params.no_filter_verification {
        if params.output_filtered_reads {
            filtered_reads.push(filter.filtered_info(rec, is_tumor, reasons));
        }
        return Ok(());
    }

    let read = filter.parse(rec, builder.num_reads(), is_tumor, snv);

    if read.alt_support == crate::snvmeth::read::AltSupport::Unknown
        && !params.no_filter_verification
    {
        if params.output_filtered_reads {
            let (_, reason) = filter.alt_support(rec, snv);
            let reason = if reason.is_empty() {
                FilterReason::SNV_NOT_COVERED
            } else {
                reason
            };
            filtered_reads.push(filter.filtered_info(rec, is_tumor, reason));
        }
        return Ok(());
    }

    // At-most-once per read name within the region; first occurrence wins
    if !seen_names.insert(read.read_name.clone()) {
        return Ok(());
    }

    let calls = decode_read(rec, ref_seq, ref_start_0);

    match read.strand {
        Strand::Forward => result.num_forward_reads += 1,
        Strand::Reverse => result.num_reverse_reads += 1,
        Strand::Unknown => {}
    }

    builder.add_read(read, calls)?;
    Ok(())
}

fn read_labels(reads: &[crate::snvmeth::read::ParsedRead], rows: &[usize]) -> Vec<String> {
    rows.iter().map(|&i| reads[i].read_name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snvmeth::read::ReadFilterConfig;
    use rust_htslib::bam::record::{Aux, Cigar, CigarString};

    const REF: &[u8] = b"NCGNCGN";

    fn params() -> ProcessParams {
        ProcessParams {
            window_size: 100,
            filter: ReadFilter::new(ReadFilterConfig {
                min_mapq: 20,
                min_read_length: 4,
                min_base_quality: 20,
                require_mod_tags: false,
            }),
            methyl_low: 0.2,
            methyl_high: 0.8,
            metrics: vec![DistanceMetric::Nhd],
            distance: DistanceConfig::default(),
            strand_matrices: true,
            clustering: None,
            output_filtered_reads: true,
            no_filter_verification: false,
        }
    }

    // Variant at the first CpG C (1-based position 2)
    fn snv() -> SomaticSnv {
        SomaticSnv {
            snv_id: 0,
            chr_id: 0,
            pos: 2,
            ref_base: b'C',
            alt_base: b'A',
            qual: 60.0,
            is_pass: true,
            somatic_conf: 0.0,
        }
    }

    fn record(name: &[u8]) -> bam::Record {
        let mut rec = bam::Record::new();
        let qual = vec![40u8; REF.len()];
        rec.set(name, Some(&CigarString(vec![Cigar::Match(7)])), REF, &qual);
        rec.set_pos(0);
        rec.set_mapq(60);
        rec.push_aux(b"MM", Aux::String("C+m?,0,0;")).unwrap();
        let probs: &[u8] = &[204, 25];
        rec.push_aux(b"ML", Aux::ArrayU8(probs.into())).unwrap();
        rec
    }

    fn state() -> (MatrixBuilder, Vec<FilteredRead>, HashSet<String>, RegionResult) {
        (
            MatrixBuilder::new(0.2, 0.8),
            Vec::new(),
            HashSet::new(),
            RegionResult::default(),
        )
    }

    #[test]
    fn duplicate_read_names_keep_first_occurrence() {
        let params = params();
        let (mut builder, mut filtered, mut seen, mut result) = state();

        let first = record(b"mol1");
        let mut second = record(b"mol1");
        second.set_flags(0x10); // same name, different strand
        let third = record(b"mol2");

        for rec in [&first, &second, &third] {
            append_read(
                rec, true, &snv(), REF, 0, &params, &mut builder, &mut filtered, &mut seen,
                &mut result,
            )
            .unwrap();
        }

        assert_eq!(builder.num_reads(), 2);
        assert_eq!(builder.reads()[0].read_name, "mol1");
        assert_eq!(builder.reads()[0].strand, Strand::Forward);
        assert_eq!(builder.reads()[1].read_name, "mol2");
        // The duplicate never counted toward strand totals
        assert_eq!(result.num_forward_reads, 2);
        assert_eq!(result.num_reverse_reads, 0);
    }

    #[test]
    fn classify_failures_are_recorded_with_reasons() {
        let params = params();
        let (mut builder, mut filtered, mut seen, mut result) = state();

        let mut rec = record(b"dup");
        rec.set_flags(0x400);
        append_read(
            &rec, true, &snv(), REF, 0, &params, &mut builder, &mut filtered, &mut seen,
            &mut result,
        )
        .unwrap();

        assert_eq!(builder.num_reads(), 0);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].reasons.contains(FilterReason::DUPLICATE));
    }

    #[test]
    fn snv_not_covered_reads_are_dropped() {
        let params = params();
        let (mut builder, mut filtered, mut seen, mut result) = state();

        let mut rec = record(b"far_away");
        rec.set_pos(500); // alignment no longer covers position 2
        append_read(
            &rec, true, &snv(), REF, 0, &params, &mut builder, &mut filtered, &mut seen,
            &mut result,
        )
        .unwrap();

        assert_eq!(builder.num_reads(), 0);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].reasons.contains(FilterReason::SNV_NOT_COVERED));
    }

    #[test]
    fn no_filter_mode_keeps_everything() {
        let mut params = params();
        params.no_filter_verification = true;
        let (mut builder, mut filtered, mut seen, mut result) = state();

        let mut dup = record(b"dup");
        dup.set_flags(0x400);
        let mut far = record(b"far_away");
        far.set_pos(500);

        for rec in [&dup, &far] {
            append_read(
                rec, true, &snv(), REF, 0, &params, &mut builder, &mut filtered, &mut seen,
                &mut result,
            )
            .unwrap();
        }

        assert_eq!(builder.num_reads(), 2);
        assert!(filtered.is_empty());
    }

    #[test]
    fn kept_reads_carry_decoded_calls() {
        let params = params();
        let (mut builder, mut filtered, mut seen, mut result) = state();

        append_read(
            &record(b"mol1"),
            true,
            &snv(),
            REF,
            0,
            &params,
            &mut builder,
            &mut filtered,
            &mut seen,
            &mut result,
        )
        .unwrap();

        builder.finalize();
        let matrix = builder.matrix().unwrap();
        assert_eq!(matrix.cpg_positions, vec![2, 5]);
        assert!((matrix.raw_row(0)[0] - 204.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn labels_follow_row_selection() {
        let params = params();
        let (mut builder, mut filtered, mut seen, mut result) = state();
        for name in [&b"a"[..], b"b", b"c"] {
            append_read(
                &record(name),
                true,
                &snv(),
                REF,
                0,
                &params,
                &mut builder,
                &mut filtered,
                &mut seen,
                &mut result,
            )
            .unwrap();
        }
        let labels = read_labels(builder.reads(), &[2, 0]);
        assert_eq!(labels, vec!["c".to_string(), "a".to_string()]);
    }
}
