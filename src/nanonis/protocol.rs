use crate::error::NanonisError;
use crate::types::{DecodedResponse, NanonisValue, WireType};
use log::debug;
use std::io::Cursor;

// Protocol constants
pub const COMMAND_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 40;
pub const ERROR_INFO_SIZE: usize = 8;
pub const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024; // 100MB
pub const RESPONSE_FLAG: i16 = 1;
pub const NO_RESPONSE_FLAG: i16 = 0;
pub const ZERO_BUFFER: i16 = 0;

#[derive(Debug, Clone)]
struct MessageHeader {
    command: [u8; COMMAND_SIZE],
    body_size: i32,
    send_response: i16,
    _padding: i16,
}

impl MessageHeader {
    fn new(command: &str, body_size: i32, expect_response: bool) -> Result<Self, NanonisError> {
        let cmd_str = command.as_bytes();
        if cmd_str.len() > COMMAND_SIZE {
            return Err(NanonisError::InvalidArgument(format!(
                "Command name '{command}' is {} bytes, limit is {COMMAND_SIZE}",
                cmd_str.len()
            )));
        }
        let mut cmd_bytes = [0u8; COMMAND_SIZE];
        cmd_bytes[..cmd_str.len()].copy_from_slice(cmd_str);

        Ok(Self {
            command: cmd_bytes,
            body_size,
            send_response: if expect_response {
                RESPONSE_FLAG
            } else {
                NO_RESPONSE_FLAG
            },
            _padding: ZERO_BUFFER,
        })
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..32].copy_from_slice(&self.command);
        buf[32..36].copy_from_slice(&self.body_size.to_be_bytes());
        buf[36..38].copy_from_slice(&self.send_response.to_be_bytes());
        buf[38..40].copy_from_slice(&self._padding.to_be_bytes());
        buf
    }
}

/// Low-level protocol handling
pub struct Protocol;

impl Protocol {
    /// Build a complete request frame: 40-byte header followed by the body.
    ///
    /// String-typed arguments are skipped; only numeric values are embedded,
    /// in the order given.
    pub fn encode_request(
        command: &str,
        expect_response: bool,
        args: &[(WireType, NanonisValue)],
    ) -> Result<Vec<u8>, NanonisError> {
        let mut body = Vec::new();
        for (wire_type, value) in args {
            if *wire_type == WireType::Str {
                continue;
            }
            wire_type.encode(value, &mut body)?;
        }

        let body_size = i32::try_from(body.len()).map_err(|_| {
            NanonisError::InvalidArgument(format!("Request body of {} bytes is too large", body.len()))
        })?;
        let header = MessageHeader::new(command, body_size, expect_response)?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&body);

        debug!(
            "Encoded {command}: header {} bytes, body {} bytes: {:02x?}",
            HEADER_SIZE,
            body.len(),
            body
        );
        Ok(frame)
    }

    /// Decode the declared response fields, which start right after the header.
    ///
    /// The response header itself is not interpreted. If enough bytes follow
    /// the declared fields, they are read as the server's error block.
    pub fn decode_response(
        response: &[u8],
        fields: &[(String, WireType)],
    ) -> Result<DecodedResponse, NanonisError> {
        let required = HEADER_SIZE + fields.iter().map(|(_, t)| t.width()).sum::<usize>();
        if response.len() < required {
            return Err(NanonisError::Decode(format!(
                "Response too short: need {required} bytes, got {}",
                response.len()
            )));
        }

        let mut cursor = Cursor::new(&response[HEADER_SIZE..]);
        let mut decoded = DecodedResponse::new();
        for (name, wire_type) in fields {
            decoded.push(name.clone(), wire_type.decode(&mut cursor)?);
        }

        Self::parse_error_info(response, required)?;
        Ok(decoded)
    }

    /// Parse the error block that follows the data section, if present.
    ///
    /// The block is only recognised when the bytes after `data_end` are exactly
    /// `status, length, message`. Anything else is taken to be response fields
    /// the catalog does not declare and is ignored.
    pub fn parse_error_info(response: &[u8], data_end: usize) -> Result<(), NanonisError> {
        let error_section = match response.get(data_end..) {
            Some(section) if section.len() >= ERROR_INFO_SIZE => section,
            _ => return Ok(()),
        };

        let (status_bytes, rest) = error_section.split_at(4);
        let (size_bytes, message_bytes) = rest.split_at(4);

        let error_status = i32::from_be_bytes(
            status_bytes
                .try_into()
                .map_err(|_| NanonisError::Decode("Invalid error status format".into()))?,
        );
        let error_desc_size = i32::from_be_bytes(
            size_bytes
                .try_into()
                .map_err(|_| NanonisError::Decode("Invalid error size format".into()))?,
        );

        if usize::try_from(error_desc_size).ok() != Some(message_bytes.len()) {
            debug!(
                "Ignoring {} trailing bytes after declared fields",
                error_section.len()
            );
            return Ok(());
        }

        let trimmed_msg = String::from_utf8_lossy(message_bytes)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();
        if trimmed_msg.is_empty() {
            return Ok(());
        }

        Err(NanonisError::ServerError {
            code: error_status,
            message: trimmed_msg,
        })
    }

    /// Body length announced in a response header
    pub fn body_size(header: &[u8; HEADER_SIZE]) -> i32 {
        i32::from_be_bytes([header[32], header[33], header[34], header[35]])
    }

    /// Command name carried in a frame header, without padding
    pub fn command_name(header: &[u8]) -> String {
        let end = header.len().min(COMMAND_SIZE);
        String::from_utf8_lossy(&header[..end])
            .trim_end_matches('\0')
            .to_string()
    }
}
