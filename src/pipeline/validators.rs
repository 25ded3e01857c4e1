//! Field parsers used by shape and gas validation

use crate::errors::{PipelineError, StageResult};
use crate::types::Address;

/// Body after a `0x` or `0X` prefix
pub fn strip_hex_prefix(raw: &str) -> Option<&str> {
    raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
}

/// Parse a non-negative quantity given as decimal or `0x` hex
pub fn parse_quantity(field: &str, raw: &str) -> StageResult<u128> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PipelineError::malformed(field, "empty value"));
    }
    if let Some(hex_body) = strip_hex_prefix(raw) {
        if hex_body.is_empty() {
            return Err(PipelineError::malformed(field, "empty hex quantity"));
        }
        if !hex_body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::malformed(field, "invalid hex digit"));
        }
        return u128::from_str_radix(hex_body, 16)
            .map_err(|_| PipelineError::malformed(field, "quantity out of range"));
    }
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(PipelineError::malformed(
            field,
            "expected an unsigned decimal or 0x quantity",
        ));
    }
    raw.parse::<u128>()
        .map_err(|_| PipelineError::malformed(field, "quantity out of range"))
}

/// Parse a `0x`-prefixed byte string; empty input and bare `0x` are empty
pub fn parse_hex_bytes(field: &str, raw: &str) -> StageResult<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let body = strip_hex_prefix(raw)
        .ok_or_else(|| PipelineError::malformed(field, "payload must be 0x-prefixed hex"))?;
    if body.len() % 2 != 0 {
        return Err(PipelineError::malformed(field, "odd number of hex digits"));
    }
    hex::decode(body).map_err(|e| PipelineError::malformed(field, e.to_string()))
}

pub fn parse_address(field: &str, raw: &str) -> StageResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| PipelineError::malformed(field, e.to_string()))
}

/// Gas quantities fail as gas errors rather than shape errors
pub fn parse_gas_quantity(field: &str, raw: &str) -> StageResult<u128> {
    parse_quantity(field, raw).map_err(|err| match err {
        PipelineError::MalformedRequest { field, reason } => {
            PipelineError::invalid_gas(format!("{}: {}", field, reason))
        }
        other => other,
    })
}
