#![doc = "app-bucket-core: reconciliation engine for app-bucket."]

//! This crate contains the reconcilers, content pipeline, package decoders and
//! the collaborator contracts they depend on. The binary crate only wires these
//! together with a config file and real external tools.
//!
//! # Layout
//! - [`records`]: declarative records (buckets, artifacts, apps, ingestions) and their status types
//! - [`contract`]: traits for the object store, record store and external tools
//! - [`gateway`]: resolves a bucket record into an opened [`contract::ObjectStore`]
//! - [`blob`]: `mem://` and `file://` object stores behind [`blob::UrlOpener`]
//! - [`pipeline`]: download, digest and icon publishing shared by both artifact kinds
//! - [`decode`]: Android and Apple package decoders, driven by the tools in [`tools`]
//! - [`icons`]: icon normalization and best-fit role selection
//! - [`association`]: asset-links and apple-app-site-association documents and their delivery
//! - [`controllers`]: one reconciler per record kind
//! - [`substrate`] and [`runtime`]: an in-process record store and scheduler for running the controllers standalone

pub mod association;
pub mod blob;
pub mod conditions;
pub mod contract;
pub mod controllers;
pub mod decode;
pub mod error;
pub mod gateway;
pub mod icons;
pub mod pipeline;
pub mod records;
pub mod runtime;
pub mod substrate;
pub mod tools;
