use super::Result;
use flate2::read::MultiGzDecoder;
use rust_htslib::{
    bam::{self, Read},
    faidx,
};
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader, Read as IoRead},
    path::{Path, PathBuf},
};

enum TableReader {
    Gzipped(MultiGzDecoder<File>),
    Plain(File),
}

impl IoRead for TableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TableReader::Gzipped(reader) => reader.read(buf),
            TableReader::Plain(reader) => reader.read(buf),
        }
    }
}

/// Opens a plain or gzipped text table (e.g. a TSV variant list).
pub fn open_table_reader(path: &Path) -> Result<impl BufRead> {
    fn is_gzipped(path: &Path) -> bool {
        let path_str = path.to_string_lossy().to_lowercase();
        path_str.ends_with(".gz") || path_str.ends_with(".gzip")
    }
    let file = File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;

    let reader: TableReader = if is_gzipped(path) {
        let gz_decoder = MultiGzDecoder::new(file);
        if gz_decoder.header().is_some() {
            TableReader::Gzipped(gz_decoder)
        } else {
            return Err(format!("Invalid gzip header: {}", path.to_string_lossy()));
        }
    } else {
        TableReader::Plain(file)
    };
    const BUFFER_CAPACITY: usize = 128 * 1024;
    Ok(BufReader::with_capacity(BUFFER_CAPACITY, reader))
}

pub fn open_genome_reader(path: &Path) -> Result<faidx::Reader> {
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let fai_path = path.with_extension(extension.to_owned() + ".fai");
    if !fai_path.exists() {
        return Err(format!(
            "Reference index file not found: {}. Create it using 'samtools faidx {}'",
            fai_path.display(),
            path.display()
        ));
    }
    faidx::Reader::from_path(path).map_err(|e| e.to_string())
}

pub fn open_bam_reader(bam_path: &Path, decompression_threads: usize) -> Result<bam::IndexedReader> {
    let mut reader = bam::IndexedReader::from_path(bam_path).map_err(|e| {
        format!(
            "Failed to create BAM reader for {}: {}",
            bam_path.display(),
            e
        )
    })?;

    if let Err(e) = reader.set_threads(decompression_threads) {
        log::warn!("Failed to set decompression threads: {}", e);
    }

    Ok(reader)
}

/// The long-lived I/O handles owned by one worker thread.
///
/// Opening a BAM and loading its index is expensive, so each worker does it
/// once and reuses the handles for every region it is assigned. Handles hold
/// a random-access cursor and must never be shared between workers.
pub struct WorkerReaders {
    pub tumor: bam::IndexedReader,
    pub normal: Option<bam::IndexedReader>,
    genome: faidx::Reader,
    chrom_lengths: HashMap<String, i64>,
}

impl WorkerReaders {
    pub fn new(
        tumor_bam: &Path,
        normal_bam: Option<&PathBuf>,
        genome_path: &Path,
        decompression_threads: usize,
    ) -> Result<Self> {
        let tumor = open_bam_reader(tumor_bam, decompression_threads)?;
        let normal = match normal_bam {
            Some(path) => Some(open_bam_reader(path, decompression_threads)?),
            None => None,
        };
        let genome = open_genome_reader(genome_path)?;
        let chrom_lengths = chrom_length_lookup(&genome)?;
        Ok(WorkerReaders {
            tumor,
            normal,
            genome,
            chrom_lengths,
        })
    }

    /// Length of a chromosome in the reference, or -1 if unknown.
    pub fn chrom_length(&self, chr_name: &str) -> i64 {
        self.chrom_lengths.get(chr_name).copied().unwrap_or(-1)
    }

    /// Fetches `[start_0, end_0)` of the reference, uppercased.
    ///
    /// Returns an empty sequence for an unknown chromosome or an invalid
    /// interval rather than failing the region.
    pub fn fetch_reference(&self, chr_name: &str, start_0: i64, end_0: i64) -> Vec<u8> {
        if start_0 < 0 || end_0 <= start_0 || !self.chrom_lengths.contains_key(chr_name) {
            return Vec::new();
        }
        match self
            .genome
            .fetch_seq(chr_name, start_0 as usize, (end_0 - 1) as usize)
        {
            Ok(seq) => {
                let mut seq = seq.to_vec();
                seq.make_ascii_uppercase();
                seq
            }
            Err(e) => {
                log::debug!(
                    "Reference fetch failed for {}:{}-{}: {}",
                    chr_name,
                    start_0,
                    end_0,
                    e
                );
                Vec::new()
            }
        }
    }
}

fn chrom_length_lookup(reader: &faidx::Reader) -> Result<HashMap<String, i64>> {
    let num_seqs = reader.n_seqs() as usize;
    let mut map = HashMap::with_capacity(num_seqs);
    for i in 0..num_seqs {
        let name = reader.seq_name(i as i32).map_err(|e| e.to_string())?;
        let len = reader.fetch_seq_len(&name);
        map.insert(name, len as i64);
    }
    Ok(map)
}

/// Collects every record whose alignment overlaps `[start_0, end_0)`.
///
/// A chromosome absent from the BAM header yields an empty vector, not an
/// error.
pub fn fetch_overlapping_reads(
    bam: &mut bam::IndexedReader,
    chr_name: &str,
    start_0: i64,
    end_0: i64,
) -> Result<Vec<bam::Record>> {
    if bam.header().tid(chr_name.as_bytes()).is_none() {
        return Ok(Vec::new());
    }
    bam.fetch((chr_name, start_0, end_0))
        .map_err(|e| format!("BAM fetch error for {}:{}-{}: {}", chr_name, start_0, end_0, e))?;

    let mut reads = Vec::new();
    let mut record = bam::Record::new();
    while let Some(result) = bam.read(&mut record) {
        result.map_err(|e| e.to_string())?;
        reads.push(record.clone());
    }
    Ok(reads)
}
