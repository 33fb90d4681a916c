//! Commands queued for a device session

/// One upstream command awaiting execution
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Service name taken from the command topic
    pub service: String,
    /// Raw command envelope (`{"command_id", "data"}`)
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(service: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            payload,
        }
    }
}
