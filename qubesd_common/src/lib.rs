mod error;
mod events;
mod protocol;

pub use error::*;
pub use events::*;
pub use protocol::*;

pub use async_trait::async_trait;

/// 1 KiB
pub const KB: u64 = 1024;
/// 1 MiB
pub const MB: u64 = KB * 1024;
/// 1 GiB
pub const GB: u64 = MB * 1024;
