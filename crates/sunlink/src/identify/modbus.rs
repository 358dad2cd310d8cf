// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Modbus register probing and serial-number extraction.

use super::{fallback_serial, IdentifiedDevice, ProbeError};
use crate::modbus::{ModbusClient, ModbusError};
use crate::protocol::{
    IdentificationSpec, ProtocolDefinition, SerialEncoding, SerialNumberSpec,
};
use crate::protocol::register_map::decode_ascii;
use crate::session::Session;
use tracing::{debug, warn};

/// Probe a session with one Modbus protocol definition.
///
/// Reads the identification register and requires the first word to be one of
/// the expected values. An in-band Modbus exception means the device answered
/// and refused: a definitive miss, not a retryable timeout.
pub async fn probe(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Result<IdentifiedDevice, ProbeError> {
    let (register, size) = match &protocol.identification {
        IdentificationSpec::RegisterProbe { register, size, .. } => (*register, *size),
        IdentificationSpec::CommandProbe { .. } => return Err(ProbeError::Miss),
    };

    let client = ModbusClient::new(protocol.unit_id(), protocol.identification_timeout());

    debug!(
        "Probing for {}: register={}, size={}",
        protocol.protocol_id, register, size
    );

    let words = match client.read_holding_registers(session, register, size).await {
        Ok(words) => words,
        Err(e) => return Err(classify(e)),
    };

    let value = match words.first() {
        Some(value) => *value,
        None => return Err(ProbeError::Miss),
    };
    if !protocol.matches_identification(value) {
        debug!(
            "{}: identification value {} not expected",
            protocol.protocol_id, value
        );
        return Err(ProbeError::Miss);
    }

    debug!(
        "Identified {}: register {} = {}",
        protocol.protocol_id, register, value
    );

    let (serial, fallback) = match read_serial(session, protocol, &client).await {
        Some(serial) => (serial, false),
        None => {
            let synthesized = fallback_serial(&protocol.protocol_id, session);
            warn!(
                "{}: serial extraction failed, using synthesized serial {}",
                protocol.protocol_id, synthesized
            );
            (synthesized, true)
        }
    };

    let mut identified = IdentifiedDevice::new(protocol, serial, fallback);
    identified.extra.insert(
        "identification_register".to_string(),
        serde_json::json!(register),
    );
    identified
        .extra
        .insert("identification_value".to_string(), serde_json::json!(value));
    Ok(identified)
}

/// Read and decode the serial-number registers. `None` on any failure; the
/// caller falls back to a synthesized serial.
pub async fn read_serial(
    session: &Session,
    protocol: &ProtocolDefinition,
    client: &ModbusClient,
) -> Option<String> {
    let (register, size, encoding) = match &protocol.serial_number {
        SerialNumberSpec::RegisterExtract {
            register,
            size,
            encoding,
        } => (*register, *size, *encoding),
        _ => return None,
    };

    let words = match client.read_holding_registers(session, register, size).await {
        Ok(words) => words,
        Err(e) => {
            debug!("{}: serial read failed: {}", protocol.protocol_id, e);
            return None;
        }
    };

    let serial = decode_serial(&words, size as usize, encoding);
    if serial.is_empty() {
        None
    } else {
        Some(serial)
    }
}

/// Decode serial registers per the configured encoding.
pub fn decode_serial(words: &[u16], size: usize, encoding: SerialEncoding) -> String {
    match encoding {
        SerialEncoding::Ascii => decode_ascii(words, size),
        SerialEncoding::Hex | SerialEncoding::Raw => {
            let mut out = String::with_capacity(size * 4);
            for word in words.iter().take(size) {
                out.push_str(&format!("{:02X}{:02X}", word >> 8, word & 0xFF));
            }
            out
        }
    }
}

fn classify(e: ModbusError) -> ProbeError {
    match e {
        // Device answered but refused, or the frame was not this protocol's.
        ModbusError::Exception { .. }
        | ModbusError::TransactionMismatch { .. }
        | ModbusError::BadProtocolId(_)
        | ModbusError::UnexpectedFunction(_)
        | ModbusError::ShortResponse(_)
        | ModbusError::ShortPayload { .. } => ProbeError::Miss,
        ModbusError::Session(e) => ProbeError::Session(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::register_map::encode_ascii;
    use crate::session::SessionError;

    #[test]
    fn test_decode_serial_ascii() {
        let words = encode_ascii("PD12K00001", 5);
        assert_eq!(
            decode_serial(&words, 5, SerialEncoding::Ascii),
            "PD12K00001"
        );
    }

    #[test]
    fn test_decode_serial_strips_nul_and_whitespace() {
        // "AB" padded with NULs across 4 words.
        let words = encode_ascii("AB", 4);
        assert_eq!(decode_serial(&words, 4, SerialEncoding::Ascii), "AB");
    }

    #[test]
    fn test_decode_serial_hex() {
        assert_eq!(
            decode_serial(&[0x12AB, 0x00FF], 2, SerialEncoding::Hex),
            "12AB00FF"
        );
    }

    #[test]
    fn test_exception_classified_as_miss() {
        let err = classify(ModbusError::Exception {
            function: 0x03,
            code: 2,
        });
        assert!(matches!(err, ProbeError::Miss));
    }

    #[test]
    fn test_timeout_classified_as_session_error() {
        let err = classify(ModbusError::Session(SessionError::Timeout));
        assert!(matches!(err, ProbeError::Session(SessionError::Timeout)));
    }
}
