//! Byte-level framing for the query protocol. Everything here is pure so it can
//! be tested without a socket.
//!
//! https://wiki.vg/Query

use super::{QueryError, SessionId};

/// Every request starts with these two bytes, followed by the packet type.
pub const MAGIC: [u8; 2] = [0xFE, 0xFD];

pub const TYPE_HANDSHAKE: u8 = 0x09;
pub const TYPE_STAT: u8 = 0x00;

/// Appended to a stat request to ask for the full stat instead of the basic
/// one.
pub const FULL_STAT_PADDING: [u8; 4] = [0x00; 4];

/// `FE FD 09` + session id
pub fn build_handshake_request(session_id: SessionId) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(7);
    buffer.extend_from_slice(&MAGIC);
    buffer.push(TYPE_HANDSHAKE);
    buffer.extend_from_slice(&session_id.to_bytes());
    buffer
}

/// `FE FD 00` + session id + challenge token (i32 BE) + 4 bytes of padding
pub fn build_full_stat_request(session_id: SessionId, challenge_token: i32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(15);
    buffer.extend_from_slice(&MAGIC);
    buffer.push(TYPE_STAT);
    buffer.extend_from_slice(&session_id.to_bytes());
    buffer.extend_from_slice(&challenge_token.to_be_bytes());
    buffer.extend_from_slice(&FULL_STAT_PADDING);
    buffer
}

/// Length of the type byte plus the session id echo that every reply starts
/// with.
pub const REPLY_HEADER_LEN: usize = 5;

/// Check the type byte and session echo of a reply and return what follows.
fn reply_body(
    response: &[u8],
    packet_type: u8,
    session_id: SessionId,
) -> Result<&[u8], QueryError> {
    if response.len() < REPLY_HEADER_LEN {
        return Err(QueryError::ProtocolMismatch {
            reason: format!("reply too short ({} bytes)", response.len()),
        });
    }
    if response[0] != packet_type {
        return Err(QueryError::ProtocolMismatch {
            reason: format!(
                "unexpected packet type {:#04x}, wanted {packet_type:#04x}",
                response[0]
            ),
        });
    }
    if response[1..REPLY_HEADER_LEN] != session_id.to_bytes() {
        return Err(QueryError::ProtocolMismatch {
            reason: format!(
                "session id mismatch (sent {session_id}, got {:02x?})",
                &response[1..REPLY_HEADER_LEN]
            ),
        });
    }
    Ok(&response[REPLY_HEADER_LEN..])
}

/// Validate a handshake reply and pull the challenge token out of it.
///
/// The reply is laid out as `09` + session id echo + the token as a
/// NUL-terminated decimal string.
pub fn parse_handshake_response(
    response: &[u8],
    session_id: SessionId,
) -> Result<i32, QueryError> {
    let token = reply_body(response, TYPE_HANDSHAKE, session_id)?;
    let Some(nul) = token.iter().position(|&b| b == 0) else {
        return Err(QueryError::MalformedChallenge {
            reason: "challenge token is not NUL-terminated".to_string(),
        });
    };
    let token = &token[..nul];

    if !token.is_ascii() {
        return Err(QueryError::MalformedChallenge {
            reason: format!("challenge token is not ascii: {token:02x?}"),
        });
    }
    // checked above, so this can't fail
    let token = String::from_utf8_lossy(token);
    token
        .trim()
        .parse::<i32>()
        .map_err(|err| QueryError::MalformedChallenge {
            reason: format!("challenge token {token:?} is not an i32: {err}"),
        })
}

/// Find the player count in a full stat reply.
///
/// After the `00` + session id header, the payload is split on NUL and the
/// token right after the first `numplayers` key is the value.
pub fn parse_stat_response(response: &[u8], session_id: SessionId) -> Result<u32, QueryError> {
    let payload = reply_body(response, TYPE_STAT, session_id)?;
    let mut tokens = payload.split(|&b| b == 0);

    if !tokens.any(|token| token == b"numplayers") {
        return Err(QueryError::MissingPlayerCount {
            reason: "no numplayers key in stat reply".to_string(),
        });
    }
    let Some(value) = tokens.next() else {
        return Err(QueryError::MissingPlayerCount {
            reason: "numplayers is the last token".to_string(),
        });
    };

    let value = String::from_utf8_lossy(value);
    value
        .trim()
        .parse::<u32>()
        .map_err(|err| QueryError::MissingPlayerCount {
            reason: format!("numplayers value {value:?} is not a count: {err}"),
        })
}
