// Copyright 2025-Present Traceline, Inc. https://www.traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Why an inbound report message could not be understood.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unsupported report message version {0}")]
    Version(u32),
    #[error("unknown report command {0:#04x}")]
    UnknownCommand(u8),
    #[error("report message truncated: {have} byte(s), need at least {need}")]
    Truncated { have: usize, need: usize },
    #[error("payload length mismatch: header declares {declared} byte(s), body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unreadable payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Relay listener failures. Everything past the bind is handled per
/// connection and logged instead of surfaced.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_error_display() {
        assert_eq!(
            MessageError::Version(3).to_string(),
            "unsupported report message version 3"
        );
        assert_eq!(
            MessageError::UnknownCommand(0x7f).to_string(),
            "unknown report command 0x7f"
        );
        assert_eq!(
            MessageError::Truncated { have: 4, need: 9 }.to_string(),
            "report message truncated: 4 byte(s), need at least 9"
        );
        assert_eq!(
            MessageError::LengthMismatch {
                declared: 10,
                actual: 7
            }
            .to_string(),
            "payload length mismatch: header declares 10 byte(s), body has 7"
        );
    }

    #[test]
    fn test_relay_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err = RelayError::from(io_err);
        assert!(err.to_string().starts_with("failed to bind relay listener"));
    }
}
