//! Emergency Resolution Module
//!
//! Fallback protocols for when a broker cannot answer authoritatively:
//! price resolution through alternate spellings and USD bridges, a
//! per-symbol delisting state machine, and the dust-to-USD recovery
//! pipeline.

mod dust;
mod resolution;

pub use dust::{DustConfig, DustError, DustPipeline, DustReport, RecoveryController};
pub use resolution::{AssetResolutionState, ResolverConfig, SymbolResolver};
