//! JSON event framing for websocket text channels.
//!
//! One text frame may carry a single JSON message (pretty-printed or not) or
//! several newline-delimited ones.

use serde::de::DeserializeOwned;

/// Every message decoded from one frame, plus the error that stopped
/// decoding early, if any.
#[derive(Debug)]
pub struct Decoded<T> {
    pub messages: Vec<T>,
    pub error: Option<serde_json::Error>,
}

/// Decode all JSON messages in one self-delimited frame. Decoding stops at
/// the first malformed message; messages before it are kept, the rest of the
/// frame is skipped. A blank frame yields nothing.
pub fn decode_frame<T: DeserializeOwned>(frame: &str) -> Decoded<T> {
    let mut messages = Vec::new();
    for item in serde_json::Deserializer::from_str(frame).into_iter::<T>() {
        match item {
            Ok(message) => messages.push(message),
            Err(error) => {
                return Decoded {
                    messages,
                    error: Some(error),
                };
            }
        }
    }
    Decoded {
        messages,
        error: None,
    }
}
