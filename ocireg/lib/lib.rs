//! `ocireg` is a client library for managing container images and OCI
//! artifacts in remote registries and local image layouts.
//!
//! # Overview
//!
//! ocireg implements the core that a registry CLI drives:
//!
//! - Reference parsing, normalization, and comparison across storage schemes
//! - A typed, byte-preserving manifest model over digest-addressed descriptors
//! - The HTTP Distribution API: challenge auth, chunked resumable uploads,
//!   cross-repository mounts, retries and mirror fallback
//! - Recursive image copy, referrer discovery (native API and fallback tags),
//!   and tag management
//!
//! # Usage Example
//!
//! ```no_run
//! use ocireg::{Client, ImageCopyOpts, OpCtx, Reference};
//!
//! # async fn run() -> ocireg::OciregResult<()> {
//! let client = Client::from_default_config().await?;
//! let ctx = OpCtx::new();
//! let src = Reference::parse("ghcr.io/example/app:v1")?;
//! let tgt = Reference::parse("ocidir://./app:v1")?;
//! client.image_copy(&ctx, &src, &tgt, ImageCopyOpts::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`] - Host configuration and the persisted config file
//! - [`manifest`] - Manifest variants and canonical serialization
//! - [`mediatype`] - OCI and Docker media type constants
//! - [`scheme`] - Storage backends (registry and OCI layout)

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod authn;
pub mod blob;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod image;
pub mod manifest;
pub mod mediatype;
pub mod opctx;
pub mod platform;
pub mod ratelimit;
pub mod reference;
pub mod referrer;
pub mod scheme;
pub mod tag;
pub mod transport;

pub use blob::{BlobReader, BlobSource, ProgressFn};
pub use client::{
    BlobCopyOpts, Client, ManifestDeleteOpts, ManifestGetOpts, ManifestHeadOpts,
};
pub use authn::{Auth, Challenge, Credential, CredentialProvider, StaticCredentials};
pub use config::{Config, Host, TlsMode};
pub use descriptor::{Descriptor, MatchOpt};
pub use digest::{Digest, DigestAlgorithm, Digester};
pub use error::*;
pub use image::ImageCopyOpts;
pub use manifest::Manifest;
pub use opctx::{OpCtx, Warning, WarningSink};
pub use platform::Platform;
pub use ratelimit::RateLimit;
pub use reference::{RefScheme, Reference};
pub use referrer::{ReferrerList, ReferrerOpts, TreeNode};
pub use tag::{RepoList, TagList};
