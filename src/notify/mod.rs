pub mod chat;
pub mod email;
pub mod template;

pub use chat::ChatSender;
pub use email::EmailSender;
pub use template::{NotificationRenderer, RenderContext};
