pub mod channel;
pub mod manager;
pub mod message;

pub use channel::{Channel, ChannelState};
pub use manager::{CommunicationManager, LAST_MESSAGE_KEY};
pub use message::{Message, MessageStatus, OutgoingMessage, REPLY_TYPE};
