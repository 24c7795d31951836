//! Per-cell user data on top of the attach/unpack machinery.

pub mod cell_data_transfer;

pub use cell_data_transfer::{CellDataTransfer, Restriction};
