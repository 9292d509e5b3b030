//! # git-sops
//!
//! Transparent SOPS-style encryption of secret files in a git repository.
//!
//! Files matching `filter=sops` patterns in `.gitattributes` are stored
//! encrypted in history and on remotes while the working copy holds
//! plaintext. Two pieces carry the design:
//!
//! - **Branch-history rewriting** ([`transform`]): an entire first-parent
//!   commit chain is converted between plaintext and ciphertext trees,
//!   preserving messages, tree structure and ordering. Data keys found on
//!   the parent commit are reused so unchanged plaintext keeps identical
//!   ciphertext blobs across commits.
//! - **Format-preserving YAML mangling** ([`mangle`]): a lossless textual
//!   transform that lets the non-surface-preserving tree engine round-trip
//!   human-authored YAML without losing stream markers, blank lines,
//!   quoting styles, inline comments, anchors or multi-line strings.
//!
//! The [`engine`] module provides the cryptographic tree engine behind a
//! three-operation interface (encrypt, decrypt, extract metadata); the
//! [`repo`] module owns the git object database layer; [`filters`] holds
//! the clean/smudge/textconv/merge endpoints the host git invokes.

pub mod app;
pub mod attrs;
pub mod config;
pub mod cryptor;
pub mod engine;
pub mod error;
pub mod filters;
pub mod list;
pub mod mangle;
pub mod rawlog;
pub mod repo;
pub mod setup;
pub mod transform;

pub use app::App;
pub use config::{OptionFlags, Options};
pub use cryptor::Outcome;
pub use error::{Result, SopsGitError};
pub use repo::Repo;
