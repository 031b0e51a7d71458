//! Service layer for registry-service.

pub mod database;
pub mod directory;
pub mod edge_cache;
pub mod error;
pub mod metrics;
pub mod secrets;
pub mod store;

pub use database::Database;
pub use directory::{
    all_principals, members_of, ClerkDirectory, DirectoryError, IdentityDirectory, MemoryDirectory,
    PrincipalPage,
};
pub use edge_cache::{CloudflareKv, EdgeCache, KeyPage, MemoryEdgeCache};
pub use error::{Denial, ServiceError};
pub use metrics::{get_metrics, init_metrics};
pub use secrets::{generate_token, hash_token, AesGcmCipher, SecretCipher};
pub use store::{MemoryStore, RegistryStore};
