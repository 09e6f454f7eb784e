pub mod checkpoint;
pub mod encryption;
pub mod error;
pub mod idle;
pub mod imap;
pub mod message;
pub mod session;

/// IMAP UID of a message in the selected mailbox.
pub type Uid = u32;
