//! EATT (Enhanced Attribute Protocol) bearer management
//!
//! This module keeps a pool of enhanced credit based channels on the EATT
//! PSM for every link and carries ATT PDUs over them:
//! - Batch establishment with a collision backoff on the peripheral side
//! - Priority and size aware slot selection with legacy fallback
//! - Routing of PDUs and completions to the ATT client or server
//! - Batch reconfiguration of every open bearer

pub mod bearer;
pub mod connection;
pub mod manager;
pub mod selector;
pub mod types;

// Re-export the public API
pub use self::bearer::{AttBearerHandler, AttHandlers, AttRole, BearerSender};
pub use self::connection::EattConnection;
pub use self::manager::EattManager;
pub use self::selector::select_slot;
pub use self::types::*;
