//! Session tokens and the permission bits they carry.

pub mod session;

pub use session::{
    ALL_PERMS, PERM_REVIEW_REQUESTS, PERM_VIEW_BOARD, PERM_VIEW_NODES, SESSION_COOKIE,
    SessionClaims, SessionKeys,
};
