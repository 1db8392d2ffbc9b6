//! Payer and maintenance authentication

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, require_maintenance_secret, AuthError, AuthState, AuthUser};
