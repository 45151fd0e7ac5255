//! Long-running background workers sharing the process with the HTTP
//! front door: tag-immutability verification and API key expiry
//! notification. Each worker owns a tick loop and exits on cancellation.

pub mod key_expiry;
pub mod tag_verifier;

pub use key_expiry::KeyExpiryNotifier;
pub use tag_verifier::TagVerifier;
