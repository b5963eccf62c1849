pub use self::context::CallContext;
pub use self::csrf::CsrfStateStore;
pub use self::directory::{DirectoryError, Identity, NewIdentity, Provider, Role, UserDirectory};
pub use self::error::AuthError;
pub use self::oauth::{GoogleOAuth, OAuthProvider};
pub use self::password::{CredentialVerifier, PasswordConfig};
pub use self::revocation::RevocationRegistry;
pub use self::session::{Session, SessionService, SessionServiceParts, TokenPair};
pub use self::store::{MemoryTtlStore, TtlStore};
pub use self::token::{Claims, TokenIssuer};

mod context;
mod csrf;
pub(crate) mod directory;
mod error;
pub(crate) mod oauth;
mod password;
mod revocation;
pub(crate) mod session;
mod store;
mod token;
