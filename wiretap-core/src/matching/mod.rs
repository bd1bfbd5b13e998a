//! Common matching primitives and the generic matcher cascade (C4's shared shape).

pub mod cascade;
pub mod levenshtein;
pub mod noise;
pub mod shingle;

pub use cascade::{match_and_claim, MatchPredicates, FUZZY_THRESHOLD};
