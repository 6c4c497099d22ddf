//! Strain-level abundance estimation from multi-mapping read alignments.
//!
//! The pipeline runs in three sequential phases: a mapping stream is folded
//! into deduplicated equivalence classes and per-reference coverage bins, an
//! EM loop converges per-strain read counts while periodically pruning
//! references the data cannot support, and the surviving counts are either
//! rolled up a taxonomy tree to a requested rank or reported per reference.

pub mod quant;

pub use quant::{QuantError, QuantOpts, Quantifier, Result};
