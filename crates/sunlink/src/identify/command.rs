// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Command-based probing for text-protocol batteries (Pytes and similar) and
//! binary-protocol BMS units (JK-BMS).
//!
//! Specializations are selected by protocol-id substring and may only enrich
//! the extracted metadata; the match criterion stays the configured
//! expected-response rule.

use super::{fallback_serial, IdentifiedDevice, ProbeError};
use crate::protocol::{IdentificationSpec, ProtocolDefinition, SerialNumberSpec};
use crate::session::{Session, SessionError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_RESPONSE_BYTES: usize = 4096;
const MAX_RESPONSE_LINES: usize = 100;

/// Probe a session with one command protocol definition.
pub async fn probe(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Result<IdentifiedDevice, ProbeError> {
    let id = protocol.protocol_id.to_ascii_lowercase();
    if id.contains("pytes") {
        probe_pytes(session, protocol).await
    } else if id.contains("jkbms") {
        probe_jkbms(session, protocol).await
    } else {
        generic_probe(session, protocol).await
    }
}

/// Send a text command and collect response lines until a prompt (`>`), an
/// empty line, or the response timeout.
pub async fn send_text_command(
    session: &Session,
    command: &str,
    line_ending: &str,
    response_timeout: Duration,
) -> Result<Option<String>, SessionError> {
    let mut framed = String::with_capacity(command.len() + line_ending.len());
    framed.push_str(command);
    framed.push_str(line_ending);
    session.write(framed.as_bytes(), response_timeout).await?;

    let deadline = Instant::now() + response_timeout;
    let separator = line_ending.as_bytes();
    let mut lines: Vec<String> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let remaining = remaining.max(Duration::from_millis(100));

        match session
            .read_until(separator, remaining, MAX_RESPONSE_BYTES)
            .await
        {
            Ok(raw) => {
                let decoded = String::from_utf8_lossy(&raw).trim().to_string();
                let terminal = decoded.starts_with('>') || decoded.is_empty();
                if !decoded.is_empty() {
                    lines.push(decoded);
                }
                if terminal || lines.len() >= MAX_RESPONSE_LINES {
                    break;
                }
            }
            Err(SessionError::Timeout) => break,
            Err(SessionError::Closed) => return Err(SessionError::Closed),
            Err(_) => break,
        }
    }

    if lines.is_empty() {
        Ok(None)
    } else {
        Ok(Some(lines.join("\n")))
    }
}

/// Send raw bytes and read whatever arrives within the timeout (up to 4 KiB).
pub async fn send_binary_command(
    session: &Session,
    command: &[u8],
    response_timeout: Duration,
) -> Result<Option<Vec<u8>>, SessionError> {
    session.write(command, response_timeout).await?;

    let response = session
        .read_available(MAX_RESPONSE_BYTES, response_timeout)
        .await?;
    if response.is_empty() {
        Ok(None)
    } else {
        Ok(Some(response))
    }
}

/// Whether a configured command string denotes raw bytes rather than text:
/// `\x`-escaped, or consisting solely of hex digits (spaces allowed).
pub fn is_binary_command(command: &str) -> bool {
    if command.starts_with("\\x") {
        return true;
    }
    let stripped: String = command.chars().filter(|c| *c != ' ').collect();
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_hexdigit())
}

/// Decode a binary command string (`\x4E\x57` or `4E 57`) into bytes.
pub fn decode_binary_command(command: &str) -> Option<Vec<u8>> {
    let hex: String = command
        .replace("\\x", "")
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

async fn probe_pytes(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Result<IdentifiedDevice, ProbeError> {
    let (command, expected) = match &protocol.identification {
        IdentificationSpec::CommandProbe {
            command,
            expected_response,
        } => (command.as_str(), expected_response.as_deref()),
        IdentificationSpec::RegisterProbe { .. } => return Err(ProbeError::Miss),
    };

    let response = send_text_command(
        session,
        command,
        protocol.line_ending(),
        protocol.identification_timeout(),
    )
    .await?;

    let response = match response {
        Some(response) => response,
        None => return Err(ProbeError::Miss),
    };

    if let Some(expected) = expected {
        if !response.to_lowercase().contains(&expected.to_lowercase()) {
            debug!("Pytes: expected '{}' not found in response", expected);
            return Err(ProbeError::Miss);
        }
    }

    info!("Identified Pytes battery on {}", session.remote_addr());

    let serial = extract_serial_command(session, protocol).await;
    let fallback = serial.is_none();
    let serial = match serial {
        Some(serial) => serial,
        None => {
            let synthesized = fallback_serial(&protocol.protocol_id, session);
            warn!(
                "{}: serial extraction failed, using synthesized serial {}",
                protocol.protocol_id, synthesized
            );
            synthesized
        }
    };

    let mut identified = IdentifiedDevice::new(protocol, serial, fallback);
    identified.model = Some("Pytes Battery".to_string());
    identified.manufacturer = Some("Pytes".to_string());
    let preview: String = response.chars().take(200).collect();
    identified
        .extra
        .insert("info_response".to_string(), serde_json::json!(preview));
    Ok(identified)
}

async fn probe_jkbms(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Result<IdentifiedDevice, ProbeError> {
    let command = match &protocol.identification {
        IdentificationSpec::CommandProbe { command, .. } => command,
        IdentificationSpec::RegisterProbe { .. } => return Err(ProbeError::Miss),
    };

    let request = decode_binary_command(command)
        .unwrap_or_else(|| command.as_bytes().to_vec());

    let response =
        send_binary_command(session, &request, protocol.identification_timeout()).await?;
    let response = match response {
        Some(response) => response,
        None => return Err(ProbeError::Miss),
    };

    // JK-BMS frames start with "NW".
    if response.len() < 2 || &response[0..2] != b"\x4E\x57" {
        debug!(
            "JK-BMS: invalid response header: {:02X?}",
            &response[..response.len().min(4)]
        );
        return Err(ProbeError::Miss);
    }

    info!("Identified JK-BMS on {}", session.remote_addr());

    let serial = fallback_serial(&protocol.protocol_id, session);
    let mut identified = IdentifiedDevice::new(protocol, serial, true);
    identified.model = Some("JK-BMS".to_string());
    identified.manufacturer = Some("JK".to_string());
    let header_hex: String = response
        .iter()
        .take(10)
        .map(|b| format!("{:02X}", b))
        .collect();
    identified
        .extra
        .insert("response_header".to_string(), serde_json::json!(header_hex));
    Ok(identified)
}

async fn generic_probe(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Result<IdentifiedDevice, ProbeError> {
    let (command, expected) = match &protocol.identification {
        IdentificationSpec::CommandProbe {
            command,
            expected_response,
        } => (command.as_str(), expected_response.as_deref()),
        IdentificationSpec::RegisterProbe { .. } => return Err(ProbeError::Miss),
    };

    if is_binary_command(command) {
        let request = match decode_binary_command(command) {
            Some(request) => request,
            None => {
                warn!("{}: malformed binary command", protocol.protocol_id);
                return Err(ProbeError::Miss);
            }
        };

        let response =
            send_binary_command(session, &request, protocol.identification_timeout()).await?;
        let response = match response {
            Some(response) => response,
            None => return Err(ProbeError::Miss),
        };

        if let Some(expected) = expected {
            let marker = if is_binary_command(expected) {
                decode_binary_command(expected).unwrap_or_default()
            } else {
                expected.as_bytes().to_vec()
            };
            if !response.starts_with(&marker) {
                return Err(ProbeError::Miss);
            }
        }
    } else {
        let response = send_text_command(
            session,
            command,
            protocol.line_ending(),
            protocol.identification_timeout(),
        )
        .await?;
        let response = match response {
            Some(response) => response,
            None => return Err(ProbeError::Miss),
        };

        if let Some(expected) = expected {
            if !response.to_lowercase().contains(&expected.to_lowercase()) {
                return Err(ProbeError::Miss);
            }
        }
    }

    info!("Identified {}", protocol.protocol_id);

    let serial = extract_serial_command(session, protocol).await;
    let fallback = serial.is_none();
    let serial =
        serial.unwrap_or_else(|| fallback_serial(&protocol.protocol_id, session));
    if fallback {
        warn!(
            "{}: serial extraction failed, using synthesized serial {}",
            protocol.protocol_id, serial
        );
    }

    Ok(IdentifiedDevice::new(protocol, serial, fallback))
}

/// Run the serial command and apply the configured capture regex.
async fn extract_serial_command(
    session: &Session,
    protocol: &ProtocolDefinition,
) -> Option<String> {
    let (command, pattern) = match &protocol.serial_number {
        SerialNumberSpec::CommandExtract {
            command,
            parse_regex,
        } => (command, parse_regex),
        _ => return None,
    };

    let regex = match regex::Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!("{}: bad serial regex: {}", protocol.protocol_id, e);
            return None;
        }
    };

    let response = send_text_command(
        session,
        command,
        protocol.line_ending(),
        protocol.identification_timeout(),
    )
    .await
    .ok()??;

    regex
        .captures(&response)
        .and_then(|captures| captures.get(1))
        .map(|capture| capture.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_detection() {
        assert!(is_binary_command("\\x4E\\x57"));
        assert!(is_binary_command("4E57"));
        assert!(is_binary_command("4E 57 01"));
        assert!(!is_binary_command("info"));
        assert!(!is_binary_command("pwr"));
        assert!(!is_binary_command(""));
    }

    #[test]
    fn test_decode_binary_escaped() {
        assert_eq!(decode_binary_command("\\x4E\\x57"), Some(vec![0x4E, 0x57]));
    }

    #[test]
    fn test_decode_binary_bare_hex() {
        assert_eq!(decode_binary_command("4E 57"), Some(vec![0x4E, 0x57]));
        assert_eq!(decode_binary_command("4e57"), Some(vec![0x4E, 0x57]));
    }

    #[test]
    fn test_decode_binary_odd_length() {
        assert_eq!(decode_binary_command("4E5"), None);
    }
}
