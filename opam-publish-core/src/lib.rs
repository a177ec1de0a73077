#![doc = "opam-publish-core: core logic library for opam-publish."]

//! This crate holds the decisions of the publishing workflow and the contracts of everything it
//! talks to. The command line, the GitHub client and the terminal live in the `opam-publish`
//! crate.
//!
//! # Workflows
//! - [`prepare::prepare`]: download a source archive and resolve a `<name>.<version>` bundle.
//! - [`validate::validate_bundle`]: check a bundle's shape and metadata files.
//! - [`submit::submit`]: push a bundle to the fork and open or update its pull request.
//!
//! Repository mirrors are handled by [`registry`] and [`mirror`]; access tokens by [`token`].

pub mod archive;
pub mod config;
pub mod contract;
pub mod error;
pub mod git;
pub mod mirror;
pub mod opam_file;
pub mod package;
pub mod prepare;
pub mod registry;
pub mod submit;
pub mod token;
pub mod validate;
