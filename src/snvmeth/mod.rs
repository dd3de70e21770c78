pub mod chrom;
pub mod clustering;
pub mod distance;
pub mod matrix;
pub mod methylation;
pub mod process;
pub mod read;
pub mod tree;
pub mod variant;
pub mod writers;
