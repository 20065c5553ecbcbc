//! Short-lived database credentials.
//!
//! - `source`: the token source capability and an HTTP endpoint implementation
//! - `cache`: the atomically swapped credential slot read by connection builders
//! - `refresher`: the background loop that keeps the slot fresh

pub mod cache;
pub mod refresher;
pub mod source;

pub use cache::{Credential, CredentialCache};
pub use refresher::{CredentialRefresher, RefreshHandle, RefreshPolicy};
pub use source::{AccessToken, EndpointTokenSource, TokenSource};
