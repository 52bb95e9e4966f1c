use crate::error::LiveIndexError;
use crate::protocol::{ClientRequest, ServerMessage};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Payload encodings a connection can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    MessagePack,
}

impl Encoding {
    pub fn tag(self) -> u8 {
        match self {
            Encoding::Json => 1,
            Encoding::MessagePack => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Encoding::Json),
            2 => Some(Encoding::MessagePack),
            _ => None,
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, LiveIndexError> {
        match self {
            Encoding::Json => serde_json::to_vec(value).map_err(|e| LiveIndexError::Encode(e.to_string())),
            Encoding::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| LiveIndexError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, LiveIndexError> {
        match self {
            Encoding::Json => serde_json::from_slice(bytes).map_err(|e| LiveIndexError::Decode(e.to_string())),
            Encoding::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| LiveIndexError::Decode(e.to_string()))
            }
        }
    }

    pub fn encode_request(self, request: &ClientRequest) -> Result<Vec<u8>, LiveIndexError> {
        self.encode(request)
    }

    pub fn decode_request(self, bytes: &[u8]) -> Result<ClientRequest, LiveIndexError> {
        self.decode(bytes)
    }

    pub fn encode_message(self, message: &ServerMessage) -> Result<Vec<u8>, LiveIndexError> {
        self.encode(message)
    }

    pub fn decode_message(self, bytes: &[u8]) -> Result<ServerMessage, LiveIndexError> {
        self.decode(bytes)
    }
}
