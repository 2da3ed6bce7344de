pub mod helpers;
mod jwt;
mod middleware;
mod password;
mod revocation;
mod service;
mod token;
pub mod totp;

pub use jwt::{Claims, JwtError, JwtService, TokenType};
pub use middleware::{
    AuthContext, AuthRejection, ClientInfo, Credential, RequireAuth, RequireInteractive,
    TotpPending,
};
pub use password::{burn_verification, hash_password, validate_password, verify_password};
pub use revocation::RevocationStore;
pub use service::{
    AccessContext, ApiKeyContext, AuthError, AuthService, LoginOutcome, SessionView, TokenPair,
    TotpSetup, TotpStatus,
};
pub use token::{
    API_KEY_PREFIX, ApiKeyGenerator, generate_agent_token, is_api_key, parse_api_key, sha256_hex,
};
