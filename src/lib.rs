//! Deployment artifact generation for blockchain node fleets.
//!
//! Two pipelines share one preset model:
//! - [`certificate::CertificateManager`] keeps per-node TLS certificate
//!   folders up to date, shelling out to an OpenSSL toolchain image and
//!   verifying everything it prints.
//! - [`topology::ComposeCompiler`] turns a preset into a deterministic
//!   docker-compose document.

pub mod certificate;
pub mod compose;
pub mod error;
pub mod model;
pub mod preset;
pub mod runner;
pub mod templates;
pub mod topology;

pub use certificate::{CertificateConfig, CertificateManager, KeyResolver, ProvidedKeyResolver};
pub use compose::DockerCompose;
pub use error::{BootstrapError, Result};
pub use model::{AddressBook, CertificateMetadata, CertificatePair, NodeCertificates};
pub use preset::Preset;
pub use runner::{DockerRunner, ToolCommand, ToolOutput, ToolRunner};
pub use topology::ComposeCompiler;
