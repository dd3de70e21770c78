use crate::cli::AnalyzeArgs;
use crate::snvmeth::{
    chrom::ChromIndex,
    distance::DistanceConfig,
    process::{process_region, ClusteringParams, ProcessParams, RegionResult},
    read::{ReadFilter, ReadFilterConfig},
    variant::{SomaticSnv, VariantTable},
    writers::RegionWriter,
};
use crate::utils::{open_bam_reader, open_genome_reader, Result, WorkerReaders};
use crossbeam_channel::{bounded, Receiver, Sender};
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use std::{
    fs,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

pub fn analyze(args: AnalyzeArgs) -> Result<()> {
    validate_config(&args)?;

    // The per-region pair loop fans out over this pool; region workers are
    // plain threads below.
    if let Err(e) = ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .thread_name(|i| format!("pairs-{}", i))
        .build_global()
    {
        log::debug!("Rayon pool already initialized: {}", e);
    }

    let mut chrom_index = ChromIndex::new();
    let variants = VariantTable::load(&args.variants_path, &mut chrom_index)?;
    if variants.is_empty() {
        return Err("No SNVs loaded from variant source".to_string());
    }

    let num_to_process = if args.max_regions > 0 {
        args.max_regions.min(variants.len())
    } else {
        variants.len()
    };

    log_configuration(&args, num_to_process);

    if args.output_filtered_reads {
        let debug_dir = args
            .debug_output_dir
            .clone()
            .unwrap_or_else(|| args.output_dir.join("debug"));
        fs::create_dir_all(&debug_dir)
            .map_err(|e| format!("Cannot create debug directory {}: {}", debug_dir.display(), e))?;
        log::info!("Filtered reads will be recorded per region; debug dir: {}", debug_dir.display());
    }

    let writer = Arc::new(RegionWriter::new(&args.output_dir, &args.variants_path)?);
    let params = Arc::new(build_params(&args));
    let chrom_index = Arc::new(chrom_index);

    let num_workers = args.num_threads.min(num_to_process).max(1);
    let (job_sender, job_receiver) = bounded::<(usize, SomaticSnv)>(num_workers * 2);
    let (result_sender, result_receiver) = bounded::<RegionResult>(num_workers * 2);

    let workers = spawn_region_workers(
        &args,
        num_workers,
        &params,
        &chrom_index,
        &writer,
        job_receiver,
        result_sender,
    );

    // Feed jobs from a separate thread so this one can drain results
    let jobs: Vec<(usize, SomaticSnv)> = variants
        .all()
        .iter()
        .take(num_to_process)
        .cloned()
        .enumerate()
        .collect();
    let feeder_thread = thread::spawn(move || {
        for job in jobs {
            if job_sender.send(job).is_err() {
                return;
            }
        }
    });

    let timer = Instant::now();
    let mut results = vec![RegionResult::default(); num_to_process];
    let mut received = 0usize;
    for result in result_receiver.iter() {
        log_region_outcome(&result, &chrom_index, variants.all());
        let slot = result.region_id;
        results[slot] = result;
        received += 1;
        if received == num_to_process {
            break;
        }
    }

    match feeder_thread.join() {
        Ok(_) => log::trace!("Feeder thread has finished."),
        Err(_) => log::error!("Feeder thread panicked."),
    }
    for handle in workers {
        if handle.join().is_err() {
            log::error!("Worker thread panicked.");
        }
    }

    log::info!(
        "All regions processed in {:.2?} ({:.1} ms/region)",
        timer.elapsed(),
        timer.elapsed().as_secs_f64() * 1000.0 / num_to_process as f64
    );

    print_summary(&results, &args);
    Ok(())
}

/// Fatal configuration checks: bad thresholds and unreadable inputs are
/// reported before any region runs.
fn validate_config(args: &AnalyzeArgs) -> Result<()> {
    if args.methyl_low >= args.methyl_high {
        return Err(format!(
            "Binary methylation thresholds are inverted: low {} >= high {}",
            args.methyl_low, args.methyl_high
        ));
    }
    if args.min_common_coverage < 1 {
        return Err("Minimum common coverage must be at least 1".to_string());
    }
    if args.metrics.is_empty() {
        return Err("At least one distance metric is required".to_string());
    }
    if args.window_size < 1 {
        return Err("Window size must be at least 1".to_string());
    }

    // Opening the handles once up front surfaces missing indexes before the
    // worker pool starts.
    open_bam_reader(&args.tumor_bam, 1)?;
    if let Some(normal) = &args.normal_bam {
        open_bam_reader(normal, 1)?;
    }
    open_genome_reader(&args.genome_path)?;
    Ok(())
}

fn build_params(args: &AnalyzeArgs) -> ProcessParams {
    ProcessParams {
        window_size: args.window_size,
        filter: ReadFilter::new(ReadFilterConfig {
            min_mapq: args.min_mapq,
            min_read_length: args.min_read_length,
            min_base_quality: args.min_base_quality,
            require_mod_tags: true,
        }),
        methyl_low: args.methyl_low,
        methyl_high: args.methyl_high,
        metrics: args.metrics.clone(),
        distance: DistanceConfig {
            metric: args.metrics[0],
            min_common_coverage: args.min_common_coverage,
            nan_strategy: args.nan_strategy,
            max_distance_value: args.max_distance_value,
            pearson_center: !args.pearson_uncentered,
            jaccard_include_unmeth: args.jaccard_include_unmeth,
        },
        strand_matrices: !args.no_strand_matrices,
        clustering: if args.no_clustering {
            None
        } else {
            Some(ClusteringParams {
                linkage: args.linkage,
                min_reads: args.clustering_min_reads,
                min_branch_length: args.min_branch_length,
            })
        },
        output_filtered_reads: args.output_filtered_reads,
        no_filter_verification: args.no_filter_verification,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_region_workers(
    args: &AnalyzeArgs,
    num_workers: usize,
    params: &Arc<ProcessParams>,
    chrom_index: &Arc<ChromIndex>,
    writer: &Arc<RegionWriter>,
    job_receiver: Receiver<(usize, SomaticSnv)>,
    result_sender: Sender<RegionResult>,
) -> Vec<JoinHandle<()>> {
    log::debug!("Initializing region worker pool with {} threads...", num_workers);
    let mut workers = Vec::with_capacity(num_workers);
    for i in 0..num_workers {
        let tumor_bam = args.tumor_bam.clone();
        let normal_bam = args.normal_bam.clone();
        let genome_path = args.genome_path.clone();
        let decompression_threads = args.decompression_threads;
        let params = params.clone();
        let chrom_index = chrom_index.clone();
        let writer = writer.clone();
        let job_receiver = job_receiver.clone();
        let result_sender = result_sender.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{}", i))
            .spawn(move || {
                let mut readers = match WorkerReaders::new(
                    &tumor_bam,
                    normal_bam.as_ref(),
                    &genome_path,
                    decompression_threads,
                ) {
                    Ok(readers) => readers,
                    Err(e) => {
                        log::error!("Worker thread failed to initialize: {}", e);
                        // Regions assigned to this worker still need result
                        // slots filled, so fail them explicitly
                        for (region_id, snv) in job_receiver {
                            let result = RegionResult {
                                region_id,
                                snv_id: snv.snv_id,
                                success: false,
                                error_message: format!("Worker initialization failed: {}", e),
                                ..RegionResult::default()
                            };
                            if result_sender.send(result).is_err() {
                                return;
                            }
                        }
                        return;
                    }
                };

                run_region_worker(
                    &mut readers,
                    &params,
                    &chrom_index,
                    &writer,
                    job_receiver,
                    result_sender,
                );
            })
            .unwrap();
        workers.push(handle);
    }
    workers
}

fn run_region_worker(
    readers: &mut WorkerReaders,
    params: &ProcessParams,
    chrom_index: &ChromIndex,
    writer: &RegionWriter,
    job_receiver: Receiver<(usize, SomaticSnv)>,
    result_sender: Sender<RegionResult>,
) {
    for (region_id, snv) in job_receiver {
        let result = process_region(&snv, region_id, readers, chrom_index, params, writer);
        if result_sender.send(result).is_err() {
            return;
        }
    }
}

fn log_region_outcome(result: &RegionResult, chrom_index: &ChromIndex, variants: &[SomaticSnv]) {
    let snv = &variants[result.snv_id];
    let chr_name = chrom_index.name(snv.chr_id).unwrap_or("?");
    if result.success {
        log::info!(
            "Region {} ({}:{}) completed: {} reads, {} CpGs, {:.1} ms",
            result.region_id,
            chr_name,
            snv.pos,
            result.num_reads,
            result.num_cpgs,
            result.elapsed_ms
        );
    } else {
        log::error!(
            "Region {} ({}:{}) failed: {}",
            result.region_id,
            chr_name,
            snv.pos,
            result.error_message
        );
    }
}

fn log_configuration(args: &AnalyzeArgs, num_to_process: usize) {
    log::info!(
        "Analysis configuration:\n  Regions: {}\n  Threads: {}\n  Window size: +-{} bp\n  \
         Min MAPQ: {}\n  Min read length: {} bp\n  Min base quality: {}\n  \
         Binary thresholds: <= {} / >= {}\n  Distance metrics: {}\n  \
         Min common coverage (C_min): {}\n  Linkage: {}\n  Output: {}",
        num_to_process,
        args.num_threads,
        args.window_size,
        args.min_mapq,
        args.min_read_length,
        args.min_base_quality,
        args.methyl_low,
        args.methyl_high,
        args.metrics.iter().map(|m| m.name()).join(", "),
        args.min_common_coverage,
        args.linkage.name(),
        args.output_dir.display()
    );
    if args.no_filter_verification {
        log::info!("No-filter mode: all reads will be output without filtering");
    }
}

fn print_summary(results: &[RegionResult], args: &AnalyzeArgs) {
    let success_count = results.iter().filter(|r| r.success).count();
    let failed: Vec<&RegionResult> = results.iter().filter(|r| !r.success).collect();

    let total_reads: usize = results.iter().map(|r| r.num_reads).sum();
    let total_cpgs: usize = results.iter().map(|r| r.num_cpgs).sum();
    let total_forward: usize = results.iter().map(|r| r.num_forward_reads).sum();
    let total_reverse: usize = results.iter().map(|r| r.num_reverse_reads).sum();
    let total_filtered: usize = results.iter().map(|r| r.num_filtered_reads).sum();
    let total_time: f64 = results.iter().map(|r| r.elapsed_ms).sum();

    let mut summary = format!(
        "\n=== Processing Summary ===\n\
         Total regions: {}\n\
         Successful: {}\n\
         Failed: {}\n\
         Total reads processed: {}\n\
         \x20 Forward strand (+): {}\n\
         \x20 Reverse strand (-): {}\n",
        results.len(),
        success_count,
        failed.len(),
        total_reads,
        total_forward,
        total_reverse,
    );
    if args.output_filtered_reads {
        summary.push_str(&format!("  Filtered out: {}\n", total_filtered));
    }
    summary.push_str(&format!(
        "Total CpG sites found: {}\n\
         Total processing time: {:.1} ms\n\
         Average reads per region: {:.1}\n",
        total_cpgs,
        total_time,
        if success_count > 0 {
            total_reads as f64 / success_count as f64
        } else {
            0.0
        },
    ));

    let regions_with_distance: Vec<&RegionResult> = results
        .iter()
        .filter(|r| r.success && (r.valid_pairs > 0 || r.invalid_pairs > 0))
        .collect();
    if !regions_with_distance.is_empty() {
        let valid: usize = regions_with_distance.iter().map(|r| r.valid_pairs).sum();
        let invalid: usize = regions_with_distance.iter().map(|r| r.invalid_pairs).sum();
        let mean_cov: f64 = regions_with_distance
            .iter()
            .map(|r| r.mean_common_coverage)
            .sum::<f64>()
            / regions_with_distance.len() as f64;
        summary.push_str(&format!(
            "\n=== Distance Summary ({}) ===\n\
             Regions with distance matrices: {}\n\
             Total valid read pairs: {}\n\
             Total invalid pairs (insufficient overlap): {}\n\
             Valid pair ratio: {:.1}%\n\
             Mean common CpG coverage: {:.2}\n",
            args.metrics[0].name(),
            regions_with_distance.len(),
            valid,
            invalid,
            if valid + invalid > 0 {
                100.0 * valid as f64 / (valid + invalid) as f64
            } else {
                0.0
            },
            mean_cov,
        ));
    }
    log::info!("{}", summary);

    for result in &failed {
        log::error!(
            "Failed region {}: {}",
            result.region_id,
            result.error_message
        );
    }
}
