pub mod conversation;
pub mod errors;
pub mod events;
pub mod message;
pub mod timestamp;
pub mod user;

pub use conversation::{
    Conversation, ConversationType, ConversationView, CreateConversationRequest, NewConversation,
};
pub use errors::ErrorResponse;
pub use events::{
    ReadNotification, ReadReceiptEvent, TypingNotification, UserStatusEvent, addresses,
};
pub use message::{
    ChatMessageRequest, Message, MessageStatus, MessageType, MessageView, NewMessage,
};
pub use timestamp::Timestamp;
pub use user::{User, UserView};
