// crates/canopen-rs-gateway/src/command.rs

//! Parsing of the CiA 309-5 URL components into gateway requests.

use crate::error::GatewayError;
use canopen_rs::nmt::NmtCommand;
use serde::Deserialize;

/// A parsed `{net}` or `{node}` URL token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Default,
    None,
    All,
    Value(u32),
}

impl Token {
    /// Accepts decimal, `0x`-prefixed hex, and the `default`/`none`/`all`
    /// keywords.
    pub fn parse(s: &str) -> Result<Token, GatewayError> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Token::Default),
            "none" => Ok(Token::None),
            "all" => Ok(Token::All),
            text => {
                let value = if let Some(hex) = text.strip_prefix("0x") {
                    u32::from_str_radix(hex, 16)
                } else {
                    text.parse()
                };
                value.map(Token::Value).map_err(|_| GatewayError::Syntax)
            }
        }
    }
}

/// One request executed against the master services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayRequest {
    Nmt {
        /// 0 addresses all nodes.
        target: u8,
        command: NmtCommand,
    },
    Read {
        node: u8,
        index: u16,
        sub_index: u8,
    },
    Write {
        node: u8,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
    },
}

/// JSON body of a `w`/`write` command.
#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub value: String,
    pub datatype: String,
}

/// Resolves the `{net}` token. Only one CAN network is driven by this
/// gateway; it is addressed as net 1 or `default`.
pub fn resolve_net(token: Token) -> Result<(), GatewayError> {
    match token {
        Token::Default | Token::Value(1) => Ok(()),
        Token::None => Err(GatewayError::NoDefaultNet),
        Token::All | Token::Value(_) => Err(GatewayError::UnsupportedNet),
    }
}

/// Resolves the `{node}` token to a concrete node id; `broadcast_ok`
/// permits `all` (NMT commands only).
pub fn resolve_node(
    token: Token,
    default_node: Option<u8>,
    broadcast_ok: bool,
) -> Result<u8, GatewayError> {
    match token {
        Token::Default => default_node.ok_or(GatewayError::NoDefaultNode),
        Token::None => Err(GatewayError::NoDefaultNode),
        Token::All => {
            if broadcast_ok {
                Ok(0)
            } else {
                Err(GatewayError::UnsupportedNode)
            }
        }
        Token::Value(v) if (1..=127).contains(&v) => Ok(v as u8),
        Token::Value(_) => Err(GatewayError::UnsupportedNode),
    }
}

fn parse_index(s: &str) -> Result<u16, GatewayError> {
    let value = if let Some(hex) = s.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    value.map_err(|_| GatewayError::Syntax)
}

fn parse_sub_index(s: &str) -> Result<u8, GatewayError> {
    let value = if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    value.map_err(|_| GatewayError::Syntax)
}

/// Builds a request from the command path segments and an optional body.
pub fn parse_command(
    node_token: Token,
    default_node: Option<u8>,
    command: &str,
    body: Option<&[u8]>,
) -> Result<GatewayRequest, GatewayError> {
    let segments: Vec<&str> = command.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["start"] => Ok(GatewayRequest::Nmt {
            target: resolve_node(node_token, default_node, true)?,
            command: NmtCommand::EnterOperational,
        }),
        ["stop"] => Ok(GatewayRequest::Nmt {
            target: resolve_node(node_token, default_node, true)?,
            command: NmtCommand::EnterStopped,
        }),
        ["preop"] | ["preoperational"] => Ok(GatewayRequest::Nmt {
            target: resolve_node(node_token, default_node, true)?,
            command: NmtCommand::EnterPreOperational,
        }),
        ["reset", "node"] => Ok(GatewayRequest::Nmt {
            target: resolve_node(node_token, default_node, true)?,
            command: NmtCommand::ResetNode,
        }),
        ["reset", "comm"] | ["reset", "communication"] => Ok(GatewayRequest::Nmt {
            target: resolve_node(node_token, default_node, true)?,
            command: NmtCommand::ResetCommunication,
        }),
        ["r", index, sub_index] | ["read", index, sub_index] => Ok(GatewayRequest::Read {
            node: resolve_node(node_token, default_node, false)?,
            index: parse_index(index)?,
            sub_index: parse_sub_index(sub_index)?,
        }),
        ["w", index, sub_index] | ["write", index, sub_index] => {
            let body = body.ok_or(GatewayError::Syntax)?;
            let write: WriteBody =
                serde_json::from_slice(body).map_err(|_| GatewayError::Syntax)?;
            Ok(GatewayRequest::Write {
                node: resolve_node(node_token, default_node, false)?,
                index: parse_index(index)?,
                sub_index: parse_sub_index(sub_index)?,
                data: encode_value(&write.value, &write.datatype)?,
            })
        }
        _ => Err(GatewayError::NotSupported),
    }
}

fn parse_int(s: &str) -> Result<i128, GatewayError> {
    let s = s.trim();
    let (negative, magnitude) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = if let Some(hex) = magnitude.strip_prefix("0x") {
        i128::from_str_radix(hex, 16)
    } else {
        magnitude.parse()
    }
    .map_err(|_| GatewayError::Syntax)?;
    Ok(if negative { -value } else { value })
}

/// Encodes a textual value with a CiA 309-5 datatype code into the
/// little-endian bytes carried over SDO.
pub fn encode_value(value: &str, datatype: &str) -> Result<Vec<u8>, GatewayError> {
    fn int_bytes(value: i128, width: usize, signed: bool) -> Result<Vec<u8>, GatewayError> {
        let bits = width as u32 * 8;
        let in_range = if signed {
            let min = -(1i128 << (bits - 1));
            let max = (1i128 << (bits - 1)) - 1;
            (min..=max).contains(&value)
        } else {
            value >= 0 && (bits == 128 || value < (1i128 << bits))
        };
        if !in_range {
            return Err(GatewayError::Syntax);
        }
        Ok(value.to_le_bytes()[..width].to_vec())
    }

    match datatype {
        "u8" => int_bytes(parse_int(value)?, 1, false),
        "u16" => int_bytes(parse_int(value)?, 2, false),
        "u32" => int_bytes(parse_int(value)?, 4, false),
        "u64" => int_bytes(parse_int(value)?, 8, false),
        "i8" => int_bytes(parse_int(value)?, 1, true),
        "i16" => int_bytes(parse_int(value)?, 2, true),
        "i32" => int_bytes(parse_int(value)?, 4, true),
        "i64" => int_bytes(parse_int(value)?, 8, true),
        "r32" => value
            .trim()
            .parse::<f32>()
            .map(|v| v.to_le_bytes().to_vec())
            .map_err(|_| GatewayError::Syntax),
        "r64" => value
            .trim()
            .parse::<f64>()
            .map(|v| v.to_le_bytes().to_vec())
            .map_err(|_| GatewayError::Syntax),
        "b" => match value.trim() {
            "0" | "false" => Ok(vec![0]),
            "1" | "true" => Ok(vec![1]),
            _ => Err(GatewayError::Syntax),
        },
        "vs" => Ok(value.as_bytes().to_vec()),
        _ => Err(GatewayError::NotSupported),
    }
}

/// Formats uploaded bytes as the `{"data":"0x…"}` hex form.
pub fn format_data(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("0x");
    // SDO data is little-endian; the textual form shows the most
    // significant byte first.
    for byte in data.iter().rev() {
        out.push_str(&format!("{:02X}", byte));
    }
    out
}
