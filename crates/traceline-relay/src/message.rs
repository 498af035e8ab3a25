// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use traceline_telemetry::layer::{Layer, LayerPayload};
use traceline_telemetry::{PeriodPayload, ReportingPeriod};

use crate::errors::MessageError;

/// Only version the relay speaks. Anything else is rejected outright so a
/// mixed deployment fails loudly instead of half-parsing.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed header: version (u32 le), command (u8), payload length (u32 le).
pub const HEADER_LEN: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    RecordTree,
    DeliverPeriod,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Command> {
        match byte {
            0 => Some(Command::RecordTree),
            1 => Some(Command::DeliverPeriod),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Command::RecordTree => 0,
            Command::DeliverPeriod => 1,
        }
    }
}

/// One framed report: a finished layer tree or a pre-aggregated period,
/// carried as a json payload behind the fixed binary header.
#[derive(Clone, Debug)]
pub struct ReportMessage {
    pub version: u32,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl ReportMessage {
    pub fn record_tree(tree: &Layer) -> Result<Self, MessageError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            command: Command::RecordTree,
            payload: serde_json::to_vec(&LayerPayload::from(tree))?,
        })
    }

    pub fn deliver_period(period: &ReportingPeriod) -> Result<Self, MessageError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            command: Command::DeliverPeriod,
            payload: serde_json::to_vec(&period.to_payload())?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.command.as_byte());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses a whole message from `bytes`. The version gate runs before
    /// anything else so unknown senders never reach payload parsing.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Truncated {
                have: bytes.len(),
                need: HEADER_LEN,
            });
        }
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != PROTOCOL_VERSION {
            return Err(MessageError::Version(version));
        }
        let command =
            Command::from_byte(bytes[4]).ok_or(MessageError::UnknownCommand(bytes[4]))?;
        let declared = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let body = &bytes[HEADER_LEN..];
        if body.len() != declared {
            return Err(MessageError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Ok(Self {
            version,
            command,
            payload: body.to_vec(),
        })
    }

    pub fn decode_tree(&self) -> Result<Layer, MessageError> {
        let payload: LayerPayload = serde_json::from_slice(&self.payload)?;
        Ok(payload.into())
    }

    pub fn decode_period(&self) -> Result<ReportingPeriod, MessageError> {
        let payload: PeriodPayload = serde_json::from_slice(&self.payload)?;
        Ok(ReportingPeriod::from_payload(payload))
    }
}
