mod align;
mod math;
mod readers;

pub use align::{aligned_query_len, locate_ref_pos, seq_to_ref_map, RefPosLookup};
pub use math::{mean, median, std_dev};
pub use readers::{
    fetch_overlapping_reads, open_bam_reader, open_genome_reader, open_table_reader, WorkerReaders,
};

pub type Result<T> = std::result::Result<T, String>;

pub fn handle_error_and_exit(err: String) -> ! {
    log::error!("{:#}", err);
    std::process::exit(1);
}
