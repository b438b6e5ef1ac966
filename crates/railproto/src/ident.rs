//! Stream-level bootstrap lines for the QUIC control stream.
//!
//! The first message on a fresh control stream identifies the endpoint:
//! `TRAIN:<id>` or `REMOTE_CONTROL:<id>`. The server answers `HELLO:<id>`
//! on the same stream. Consoles bind in-band with
//! `MAP_CONNECTION:<console_id>:<train_id>`.

use crate::packet::ProtoError;

/// Endpoint role declared at identification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Train,
    Console,
}

/// Parsed identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identify {
    pub role: Role,
    pub id: String,
}

impl Identify {
    pub fn train(id: impl Into<String>) -> Self {
        Self { role: Role::Train, id: id.into() }
    }

    pub fn console(id: impl Into<String>) -> Self {
        Self { role: Role::Console, id: id.into() }
    }

    pub fn parse(line: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(line).map_err(|_| ProtoError::BadIdentification)?;
        if let Some(id) = text.strip_prefix("TRAIN:") {
            if id.is_empty() {
                return Err(ProtoError::BadIdentification);
            }
            return Ok(Identify::train(id));
        }
        if let Some(id) = text.strip_prefix("REMOTE_CONTROL:") {
            if id.is_empty() {
                return Err(ProtoError::BadIdentification);
            }
            return Ok(Identify::console(id));
        }
        Err(ProtoError::BadIdentification)
    }

    pub fn to_line(&self) -> String {
        match self.role {
            Role::Train => format!("TRAIN:{}", self.id),
            Role::Console => format!("REMOTE_CONTROL:{}", self.id),
        }
    }
}

/// Server reply confirming identification.
pub fn hello_line(id: &str) -> String {
    format!("HELLO:{id}")
}

/// Parse a `HELLO:<id>` reply.
pub fn parse_hello(line: &[u8]) -> Result<String, ProtoError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.strip_prefix("HELLO:"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(ProtoError::BadIdentification)
}

/// In-band binding request from a console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapConnection {
    pub console_id: String,
    pub train_id: String,
}

impl MapConnection {
    pub fn parse(line: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ProtoError::BadControlLine("not UTF-8".into()))?;
        let rest = text
            .strip_prefix("MAP_CONNECTION:")
            .ok_or_else(|| ProtoError::BadControlLine(text.to_string()))?;
        let (console_id, train_id) = rest
            .split_once(':')
            .ok_or_else(|| ProtoError::BadControlLine(text.to_string()))?;
        if console_id.is_empty() || train_id.is_empty() {
            return Err(ProtoError::BadControlLine(text.to_string()));
        }
        Ok(Self {
            console_id: console_id.to_string(),
            train_id: train_id.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!("MAP_CONNECTION:{}:{}", self.console_id, self.train_id)
    }

    /// Whether a control-stream message looks like a binding request.
    pub fn matches(line: &[u8]) -> bool {
        line.starts_with(b"MAP_CONNECTION:")
    }
}
