use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The subset of node-to-node message types the streaming layer produces. Framing and
///  dispatch of these messages is the job of the surrounding node; the envelope is handed
///  over as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum I2npMessageKind {
    DatabaseStore = 1,
    Data = 20,
}

#[derive(Debug, Clone)]
pub struct I2npMessage {
    pub kind: I2npMessageKind,
    pub payload: Vec<u8>,
}

impl I2npMessage {
    pub fn new(kind: I2npMessageKind, payload: Vec<u8>) -> I2npMessage {
        I2npMessage { kind, payload }
    }
}
