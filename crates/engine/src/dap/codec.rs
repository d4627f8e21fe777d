// StepSnap - Execution snapshot recorder for debug adapters
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Base protocol framing: a `Content-Length` header block followed by a JSON
//! body.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::types::ProtocolMessage;
use crate::DapError;

const CONTENT_LENGTH: &str = "Content-Length";

/// Upper bound of a single message body.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Serializes a message with its header block.
pub fn encode_message(message: &ProtocolMessage) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads the next message. Returns `None` on a clean end of stream between
/// two messages.
///
/// A well-framed body that does not decode yields [`DapError::Undecodable`]
/// after the whole frame has been consumed, so the caller may keep reading.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ProtocolMessage>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut line = String::new();
    let mut first = true;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            if first {
                return Ok(None);
            }
            return Err(DapError::Codec("stream ended inside a header block".to_string()));
        }
        first = false;

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }

        let Some((name, value)) = header.split_once(':') else {
            return Err(DapError::Codec(format!("malformed header line {header:?}")));
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|e| DapError::Codec(format!("invalid {CONTENT_LENGTH} {value:?}: {e}")))?;
            content_length = Some(length);
        }
    }

    let length =
        content_length.ok_or_else(|| DapError::Codec(format!("missing {CONTENT_LENGTH}")))?;
    if length > MAX_MESSAGE_SIZE {
        return Err(DapError::Codec(format!("message of {length} bytes exceeds the limit")));
    }

    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map(Some).map_err(|e| DapError::Undecodable(e.to_string()))
}
