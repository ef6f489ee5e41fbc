//! OAuth redirect binding.
//!
//! The login flow for both platforms is:
//! 1. Login start: resolve the visitor's session (`SessionManager::get_or_create`)
//! 2. Mint a state token carrying the tenant UUID (`StateTokenCodec::generate`)
//!    and send it as the `state` parameter of the provider's authorize URL
//! 3. Callback: validate `state` (`StateTokenCodec::validate`), then check the
//!    session cookie agrees with the embedded tenant (`SessionManager::verify`)
//! 4. Store the exchanged access token in the `CredentialVault`

mod state_token;

pub use state_token::{StateTokenCodec, StateTokenError, DEFAULT_TTL_SECONDS};
