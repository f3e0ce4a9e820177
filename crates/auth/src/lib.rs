//! Authentication and authorization for voxgate
//!
//! - Credential vault (AES-256-GCM, per-tenant key derivation)
//! - JWT session tokens with revocation and refresh pairing
//! - Role → permission expansion with wildcard evaluation
//! - API key lifecycle
//! - Tenant resolution and the login flow

pub mod apikey;
pub mod login;
pub mod password;
pub mod permission;
pub mod resolver;
pub mod token;
pub mod vault;

pub use apikey::{hash_key, scope_permissions, ApiKeyManager, IssuedKey};
pub use login::{LoginConfig, LoginService};
pub use password::{hash_password, verify_password};
pub use permission::{perms, permission_satisfied, PermissionCheck, RoleTable};
pub use resolver::{is_health_path, ResolveInput, TenantResolver};
pub use token::{
    TokenClaims, TokenKeys, TokenPair, TokenService, TokenType, AUDIENCE, ISSUER,
    TOKEN_MIN_VERSION,
};
pub use vault::CredentialVault;
