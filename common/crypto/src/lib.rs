//! Transport-security material for per-tenant broker sessions.
//!
//! Material is issued sealed (AES-256-GCM under the deployment [`MasterKey`]),
//! unsealed on demand and written to a local directory for as long as at least
//! one caller holds a lease on it.

pub mod envelope;
pub mod error;
pub mod material;
pub mod materializer;

pub use envelope::{generate_key, MasterKey};
pub use error::{CryptoError, MaterialError};
pub use material::{
    CryptoMaterial, DirectoryMaterialSource, InMemoryMaterialSource, MaterialSource, SealedMaterial,
};
pub use materializer::{acquire_lease, CertificateMaterializer, MaterialLease, MaterialProvider};
