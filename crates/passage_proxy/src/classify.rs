//! Shallow CQL inspection for the mirror path.
//!
//! The proxy never interprets queries on behalf of the client; it only needs
//! to name each request as an operation path `/<opcode>/<action>/<table>` so
//! the mirror dispatch can decide whether and where to replay it, and to
//! track prepared-statement ids across PREPARE request / RESULT reply pairs
//! so later EXECUTE frames resolve to the statement they run.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::frame;

pub const OPCODE_STARTUP: u8 = 0x01;
pub const OPCODE_OPTIONS: u8 = 0x05;
pub const OPCODE_QUERY: u8 = 0x07;
pub const OPCODE_RESULT: u8 = 0x08;
pub const OPCODE_PREPARE: u8 = 0x09;
pub const OPCODE_EXECUTE: u8 = 0x0A;
pub const OPCODE_REGISTER: u8 = 0x0B;
pub const OPCODE_BATCH: u8 = 0x0D;
pub const OPCODE_AUTH_RESPONSE: u8 = 0x0F;

/// RESULT body kind identifying a prepared-statement result.
const RESULT_KIND_PREPARED: i32 = 0x0004;

/// Sentinel path for an EXECUTE whose prepared id was never observed.
pub const UNKNOWN_PREPARED_PATH: &str = "/unknown-prepared";

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("compression flag set, cannot inspect the body")]
    Compressed,
    #[error("frame body truncated while reading {0}")]
    Truncated(&'static str),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("statement is not valid utf-8")]
    BadEncoding,
    #[error("request opcode {0:#04x} is not recognised")]
    UnknownOpcode(u8),
}

/// Prepared-statement path registry.
///
/// A PREPARE request parks its statement's path under the request's stream
/// id; the matching RESULT/Prepared reply promotes that entry under the
/// server-issued prepared id, which later EXECUTE frames carry. Entries live
/// for the life of the process; the server's prepared-statement cache is the
/// authority on expiry.
#[derive(Default)]
pub struct PreparedQueries {
    inner: Mutex<PreparedInner>,
}

#[derive(Default)]
struct PreparedInner {
    path_by_stream_id: HashMap<u16, String>,
    path_by_prepared_id: HashMap<Vec<u8>, String>,
}

impl PreparedQueries {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_pending(&self, stream: u16, path: String) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.path_by_stream_id.insert(stream, path);
        }
    }

    /// Promote the pending entry for `stream` under the server-issued id.
    fn promote(&self, stream: u16, prepared_id: &[u8]) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(path) = inner.path_by_stream_id.remove(&stream) {
                inner.path_by_prepared_id.insert(prepared_id.to_vec(), path);
            }
        }
    }

    pub fn path_for_prepared(&self, prepared_id: &[u8]) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.path_by_prepared_id.get(prepared_id).cloned())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.path_by_stream_id.len())
            .unwrap_or(0)
    }
}

/// Observe a reply frame, promoting prepared ids from RESULT/Prepared.
///
/// Every other reply is ignored; the proxy never interprets result rows.
pub fn observe_reply(prepared: &PreparedQueries, frame_bytes: &[u8]) -> Result<(), ClassifyError> {
    if frame::is_compressed(frame_bytes) {
        return Err(ClassifyError::Compressed);
    }
    if frame::opcode(frame_bytes) != OPCODE_RESULT {
        return Ok(());
    }
    let body = frame::body(frame_bytes);
    if body.len() < 4 {
        return Err(ClassifyError::Truncated("result kind"));
    }
    let kind = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if kind != RESULT_KIND_PREPARED {
        return Ok(());
    }
    let (prepared_id, _) =
        read_short_bytes(&body[4..]).ok_or(ClassifyError::Truncated("prepared id"))?;
    prepared.promote(frame::stream_id(frame_bytes), prepared_id);
    Ok(())
}

/// Classify a request frame into operation paths.
///
/// Most requests yield exactly one path; BATCH yields one per inner
/// statement. PREPARE additionally parks the statement's query-form path
/// under the request's stream id so the eventual EXECUTE resolves to a
/// replayable operation.
pub fn classify_request(
    prepared: &PreparedQueries,
    frame_bytes: &[u8],
) -> Result<Vec<String>, ClassifyError> {
    if frame::is_compressed(frame_bytes) {
        return Err(ClassifyError::Compressed);
    }
    let body = frame::body(frame_bytes);
    match frame::opcode(frame_bytes) {
        OPCODE_QUERY => {
            let (statement, _) = read_long_string(body)?;
            Ok(vec![statement_path("query", statement)])
        }
        OPCODE_PREPARE => {
            let (statement, _) = read_long_string(body)?;
            prepared.record_pending(
                frame::stream_id(frame_bytes),
                statement_path("query", statement),
            );
            Ok(vec![statement_path("prepare", statement)])
        }
        OPCODE_EXECUTE => {
            let (prepared_id, _) =
                read_short_bytes(body).ok_or(ClassifyError::Truncated("prepared id"))?;
            Ok(vec![prepared
                .path_for_prepared(prepared_id)
                .unwrap_or_else(|| UNKNOWN_PREPARED_PATH.to_string())])
        }
        OPCODE_BATCH => classify_batch(prepared, body),
        OPCODE_STARTUP => Ok(vec!["/startup".to_string()]),
        OPCODE_OPTIONS => Ok(vec!["/options".to_string()]),
        OPCODE_REGISTER => Ok(vec!["/register".to_string()]),
        OPCODE_AUTH_RESPONSE => Ok(vec!["/auth-response".to_string()]),
        other => Err(ClassifyError::UnknownOpcode(other)),
    }
}

/// Walk a BATCH body and emit one path per inner statement.
fn classify_batch(prepared: &PreparedQueries, body: &[u8]) -> Result<Vec<String>, ClassifyError> {
    // <type:byte><n:short>, then n of <kind:byte><query|prepared-id><values>.
    if body.len() < 3 {
        return Err(ClassifyError::Truncated("batch header"));
    }
    let count = u16::from_be_bytes([body[1], body[2]]) as usize;
    let mut rest = &body[3..];
    let mut paths = Vec::with_capacity(count);
    for _ in 0..count {
        let (&statement_kind, after_kind) = rest
            .split_first()
            .ok_or(ClassifyError::Truncated("batch statement kind"))?;
        let after_statement = match statement_kind {
            0 => {
                let (statement, after) = read_long_string(after_kind)?;
                paths.push(statement_path("query", statement));
                after
            }
            1 => {
                let (prepared_id, after) = read_short_bytes(after_kind)
                    .ok_or(ClassifyError::Truncated("batch prepared id"))?;
                paths.push(
                    prepared
                        .path_for_prepared(prepared_id)
                        .unwrap_or_else(|| UNKNOWN_PREPARED_PATH.to_string()),
                );
                after
            }
            _ => return Err(ClassifyError::Malformed("batch statement kind")),
        };
        rest = skip_values(after_statement).ok_or(ClassifyError::Truncated("batch values"))?;
    }
    Ok(paths)
}

/// Build `/<opcode>/<action>/<table-ref>` for one CQL statement.
///
/// Action detection is keyword-based on the first significant token; the
/// table reference is the literal token after FROM / INTO / UPDATE /
/// TRUNCATE, left untouched for [`extract_table_info`] to normalize.
fn statement_path(opcode: &str, statement: &str) -> String {
    let mut tokens = statement.split_whitespace();
    let Some(first) = tokens.next() else {
        return format!("/{opcode}");
    };
    let action = first.trim_end_matches(';').to_ascii_lowercase();
    let target = match action.as_str() {
        "use" => tokens.next(),
        "select" | "delete" => token_after(tokens, "from"),
        "insert" => token_after(tokens, "into"),
        "update" => tokens.next(),
        "truncate" => {
            let token = tokens.next();
            match token {
                Some(t) if t.eq_ignore_ascii_case("table") => tokens.next(),
                other => other,
            }
        }
        _ => None,
    };
    match target {
        Some(table_ref) => format!("/{opcode}/{action}/{table_ref}"),
        None => format!("/{opcode}/{action}"),
    }
}

fn token_after<'a>(mut tokens: impl Iterator<Item = &'a str>, keyword: &str) -> Option<&'a str> {
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case(keyword) {
            return tokens.next();
        }
    }
    None
}

/// Split a table reference token into `(keyspace, table)`.
///
/// Accepts the literal token from a statement: `table`, `ks.table`,
/// `ks.table;`, `ks.table(col,...`, and quoted variants. Unquoted
/// identifiers fold to lowercase; double-quoted identifiers keep their case
/// and lose the quotes. Idempotent once normalized.
pub fn extract_table_info(token: &str) -> (Option<String>, String) {
    let token = token.split(';').next().unwrap_or(token);
    let (keyspace, table) = match token.split_once('.') {
        Some((keyspace, table)) => (Some(keyspace), table),
        None => (None, token),
    };
    let table = table.split('(').next().unwrap_or(table);
    (
        keyspace.map(normalize_identifier),
        normalize_identifier(table),
    )
}

/// Unquoted CQL identifiers are case-insensitive; quoted ones are literal.
pub fn normalize_identifier(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_ascii_lowercase()
    }
}

/// Read a `[long string]` (4-byte length prefix) off the front of `input`.
fn read_long_string(input: &[u8]) -> Result<(&str, &[u8]), ClassifyError> {
    if input.len() < 4 {
        return Err(ClassifyError::Truncated("string length"));
    }
    let len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
    let rest = &input[4..];
    if rest.len() < len {
        return Err(ClassifyError::Truncated("string body"));
    }
    let text = std::str::from_utf8(&rest[..len]).map_err(|_| ClassifyError::BadEncoding)?;
    Ok((text, &rest[len..]))
}

/// Read a `[short bytes]` (2-byte length prefix) off the front of `input`.
fn read_short_bytes(input: &[u8]) -> Option<(&[u8], &[u8])> {
    if input.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([input[0], input[1]]) as usize;
    let rest = &input[2..];
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

/// Skip the bound-values block that follows a batch statement.
fn skip_values(input: &[u8]) -> Option<&[u8]> {
    if input.len() < 2 {
        return None;
    }
    let count = u16::from_be_bytes([input[0], input[1]]) as usize;
    let mut rest = &input[2..];
    for _ in 0..count {
        if rest.len() < 4 {
            return None;
        }
        let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        rest = &rest[4..];
        // Negative lengths mark null/unset values and carry no bytes.
        if len > 0 {
            let len = len as usize;
            if rest.len() < len {
                return None;
            }
            rest = &rest[len..];
        }
    }
    Some(rest)
}
