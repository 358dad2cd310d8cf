// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Modbus-TCP framing shared by the prober and the register pollers.
//!
//! An ADU is the 7-byte MBAP header (transaction id, protocol id 0, length,
//! unit id) followed by the PDU. Responses are read as 9 header bytes
//! (MBAP + function code + byte count / exception code) plus the payload the
//! byte-count field announces.

use crate::session::{Session, SessionError};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Build an MBAP header. `length` covers unit id + PDU.
pub fn build_mbap(transaction_id: u16, length: u16, unit_id: u8) -> [u8; 7] {
    let mut header = [0u8; 7];
    header[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    // Protocol id 0 = Modbus.
    header[2..4].copy_from_slice(&0u16.to_be_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());
    header[6] = unit_id;
    header
}

/// Build a read-holding-registers request ADU.
pub fn build_read_request(transaction_id: u16, unit_id: u8, register: u16, count: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(READ_HOLDING_REGISTERS);
    pdu.extend_from_slice(&register.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());

    let mut adu = build_mbap(transaction_id, (pdu.len() + 1) as u16, unit_id).to_vec();
    adu.extend_from_slice(&pdu);
    adu
}

/// Build a write-single-register request ADU.
pub fn build_write_single(transaction_id: u16, unit_id: u8, register: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(WRITE_SINGLE_REGISTER);
    pdu.extend_from_slice(&register.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());

    let mut adu = build_mbap(transaction_id, (pdu.len() + 1) as u16, unit_id).to_vec();
    adu.extend_from_slice(&pdu);
    adu
}

/// Build a write-multiple-registers request ADU.
pub fn build_write_multiple(
    transaction_id: u16,
    unit_id: u8,
    register: u16,
    values: &[u16],
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&register.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }

    let mut adu = build_mbap(transaction_id, (pdu.len() + 1) as u16, unit_id).to_vec();
    adu.extend_from_slice(&pdu);
    adu
}

/// Validate a response ADU and extract the register words.
///
/// `data` must carry the full response (9 header bytes + payload). An
/// exception response (function code high bit set) is a definitive refusal by
/// the device, distinct from a timeout.
pub fn parse_read_response(data: &[u8], expected_transaction_id: u16) -> Result<Vec<u16>, ModbusError> {
    if data.len() < 9 {
        return Err(ModbusError::ShortResponse(data.len()));
    }

    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    if transaction_id != expected_transaction_id {
        return Err(ModbusError::TransactionMismatch {
            got: transaction_id,
            expected: expected_transaction_id,
        });
    }

    let protocol_id = u16::from_be_bytes([data[2], data[3]]);
    if protocol_id != 0 {
        return Err(ModbusError::BadProtocolId(protocol_id));
    }

    let function_code = data[7];
    if function_code & 0x80 != 0 {
        return Err(ModbusError::Exception {
            function: function_code & 0x7F,
            code: data[8],
        });
    }
    if function_code != READ_HOLDING_REGISTERS {
        return Err(ModbusError::UnexpectedFunction(function_code));
    }

    let byte_count = data[8] as usize;
    let payload = &data[9..];
    if payload.len() < byte_count {
        return Err(ModbusError::ShortPayload {
            expected: byte_count,
            got: payload.len(),
        });
    }

    let words = payload[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(words)
}

/// Validate a write response (echo) ADU.
fn check_write_response(data: &[u8], expected_transaction_id: u16) -> Result<(), ModbusError> {
    if data.len() < 8 {
        return Err(ModbusError::ShortResponse(data.len()));
    }
    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    if transaction_id != expected_transaction_id {
        return Err(ModbusError::TransactionMismatch {
            got: transaction_id,
            expected: expected_transaction_id,
        });
    }
    let function_code = data[7];
    if function_code & 0x80 != 0 {
        return Err(ModbusError::Exception {
            function: function_code & 0x7F,
            code: data.get(8).copied().unwrap_or(0),
        });
    }
    Ok(())
}

/// Modbus client bound to one session and unit id.
///
/// Transaction ids increment per request and wrap at 0xFFFF; the response is
/// matched against the request's id.
pub struct ModbusClient {
    unit_id: u8,
    timeout: Duration,
    transaction_id: AtomicU16,
}

impl ModbusClient {
    pub fn new(unit_id: u8, timeout: Duration) -> Self {
        Self {
            unit_id,
            timeout,
            transaction_id: AtomicU16::new(0),
        }
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Read `count` holding registers starting at `register`.
    pub async fn read_holding_registers(
        &self,
        session: &Session,
        register: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let transaction_id = self.next_transaction_id();
        let request = build_read_request(transaction_id, self.unit_id, register, count);

        session.write(&request, self.timeout).await?;

        let header = session.read_exact(9, self.timeout).await?;
        let function_code = header[7];
        let response = if function_code & 0x80 != 0 {
            // Exception ADU is complete at 9 bytes.
            header
        } else {
            let byte_count = header[8] as usize;
            if byte_count == 0 {
                header
            } else {
                let payload = session.read_exact(byte_count, self.timeout).await?;
                let mut full = header;
                full.extend_from_slice(&payload);
                full
            }
        };

        parse_read_response(&response, transaction_id)
    }

    /// Write one holding register and verify the echo.
    pub async fn write_single_register(
        &self,
        session: &Session,
        register: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let transaction_id = self.next_transaction_id();
        let request = build_write_single(transaction_id, self.unit_id, register, value);

        session.write(&request, self.timeout).await?;
        let response = session.read_exact(12, self.timeout).await?;
        check_write_response(&response, transaction_id)
    }

    /// Write multiple holding registers and verify the acknowledgement.
    pub async fn write_multiple_registers(
        &self,
        session: &Session,
        register: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let transaction_id = self.next_transaction_id();
        let request = build_write_multiple(transaction_id, self.unit_id, register, values);

        session.write(&request, self.timeout).await?;
        let response = session.read_exact(12, self.timeout).await?;
        check_write_response(&response, transaction_id)
    }
}

/// Modbus error types. `Exception` is the in-band refusal; everything else is
/// either transport failure or a malformed frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModbusError {
    #[error("response too short: {0} bytes")]
    ShortResponse(usize),
    #[error("transaction id mismatch: got {got}, expected {expected}")]
    TransactionMismatch { got: u16, expected: u16 },
    #[error("invalid protocol id: {0}")]
    BadProtocolId(u16),
    #[error("modbus exception: function={function:#04x} code={code}")]
    Exception { function: u8, code: u8 },
    #[error("unexpected function code: {0:#04x}")]
    UnexpectedFunction(u8),
    #[error("payload too short: expected {expected} bytes, got {got}")]
    ShortPayload { expected: usize, got: usize },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ModbusError {
    /// True when the device answered but refused (exception response). Used
    /// by the prober to distinguish a definitive miss from a timeout.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Session(SessionError::Timeout))
    }
}
