//! gitpoller credential adapters.
//!
//! Implements [`polling::CredentialResolver`]:
//!
//! | Resolver | Source |
//! |----------|--------|
//! | [`DirectorySecretResolver`] | `{directory}/{namespace}/{name}/{key}` files, as mounted Kubernetes secrets are laid out |
//! | [`StaticSecretResolver`] | an in-memory map |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Token values are never logged.

mod directory;
mod fixed;

pub use directory::{DirectorySecretResolver, SecretsConfig, DEFAULT_SECRETS_DIRECTORY};
pub use fixed::StaticSecretResolver;
