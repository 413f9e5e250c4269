pub mod addr;
pub mod error;
pub mod message;
pub mod payload;

pub use addr::{Addr, AddrError, ChatKind};
pub use error::{ServiceError, ServiceResult};
pub use message::{MediaInfo, MediaKind, Message};
pub use payload::ReceivedMessage;
