//! BIDS dataset store.
//!
//! The pipeline only needs a small slice of a dataset store: create or open
//! a dataset, address a row by frequency and id, register sinks, and read or
//! write typed values inside a scoped connection. This module provides that
//! slice over a plain BIDS directory tree.

pub mod dataset;
pub mod row;

pub use dataset::{derivative_key, BidsDataset, Connection, FileSet, Sink, BIDS_VERSION};
pub use row::{AnalysisLevel, Frequency, RowAddress, DEFAULT_BIDS_ID};
