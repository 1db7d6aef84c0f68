//
// lib.rs
// Dicom-Anonymizer-rs
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Identity core first, then the DICOM-facing glue around it.
pub mod allocator;
pub mod error;
pub mod faker;
pub mod models;
pub mod persistence;
pub mod resolver;
pub mod store;

pub mod anonymize;
pub mod cli;
pub mod config;
pub mod dicom_access;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod walker;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::AnonymizerError;
pub use resolver::IdentityResolver;
pub use store::AssociationStore;
