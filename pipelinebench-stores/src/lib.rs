//! Store clients used by the pipeline benchmark.
//!
//! The benchmark talks to two external systems: an *artifact store* that receives uploaded
//! payloads, and a *completion store* in which the downstream processor records that it has
//! handled an artifact. Both are abstracted behind the [`ArtifactStore`] and [`CompletionStore`]
//! traits so the benchmark can run against S3 and DynamoDB, or entirely in memory.
//!
//! - [`s3`] and [`dynamodb`] wrap the AWS SDK clients. They work against AWS proper as well as
//!   LocalStack via an endpoint override, see [`AwsOptions`].
//! - [`in_memory`] provides process-local stores plus a [`SimulatedProcessor`] that plays the role
//!   of the downstream pipeline in tests and offline runs.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod common;
pub mod dynamodb;
pub mod in_memory;
mod key;
pub mod s3;

pub use common::*;
pub use in_memory::{InMemoryArtifactStore, InMemoryCompletionStore, SimulatedProcessor};
pub use key::ArtifactKey;
