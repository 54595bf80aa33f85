//! Session gateway: cookie logins against the configured account table.
//!
//! The console relay and inventory routes only ever ask one question of this
//! module: is the caller holding a live session.

pub mod middleware;
pub mod session;
pub mod types;

pub use middleware::{require_auth, AuthenticatedUser, SESSION_COOKIE};
pub use session::{hash_password, SessionStore, UserTable};
pub use types::*;
