//! Anthropic Messages protocol on top of the OpenAI-shaped upstream
//!
//! - `request`: Anthropic request → upstream chat request
//! - `response`: upstream completion → Anthropic message
//! - `stream`: chunk-by-chunk re-encoding of an upstream stream into
//!   Anthropic stream events
//! - `sse`: wire framing for both client protocols

pub mod anthropic;
mod error;
pub mod request;
pub mod response;
pub mod sse;
pub mod stream;

pub use error::{Error, Result};
pub use request::to_chat_request;
pub use response::{map_stop_reason, to_messages_response};
pub use stream::{StreamEvent, StreamTranslator};
