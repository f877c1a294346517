//! kiln-lib: Core types and logic for kiln
//!
//! This crate takes a package recipe from name to installed, tested files:
//! - `Recipe`: a validated, immutable description of one package
//! - `VerifiedArtifact`: a downloaded source archive whose checksum matched
//! - `InstallManifest`: the files a build produced and where they land
//! - `Pipeline`: runs every stage in order and reports the first failure

pub mod build;
pub mod config;
pub mod consts;
pub mod deps;
pub mod fetch;
pub mod install;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod receipt;
pub mod recipe;
pub mod smoke;
pub mod verify;
