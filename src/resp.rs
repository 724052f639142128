//! Redis Serialization Protocol (RESP) values.
//!
//! The monitor only speaks a small slice of RESP to the upstream instance:
//! commands go out as arrays of bulk strings, and the handshake replies as
//! well as every MONITOR log line come back as single-line simple strings,
//! errors or integers. Multi-line replies are never expected and are
//! rejected without being read.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RespError {
    #[error("unknown RESP type")]
    UnknownRespType,
    #[error("failed to parse integer")]
    FailedToParseInteger,
    #[error("unsupported reply: {0}")]
    UnsupportedReply(String),
}

#[derive(Debug, PartialEq, Clone)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(String),
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn encode(&self) -> String {
        match self {
            RespValue::SimpleString(s) => format!("+{}\r\n", s),
            RespValue::Error(s) => format!("-{}\r\n", s),
            RespValue::Integer(i) => format!(":{}\r\n", i),
            RespValue::BulkString(s) => format!("${}\r\n{}\r\n", s.len(), s),
            RespValue::Array(values) => {
                let mut encoded = format!("*{}\r\n", values.len());
                for value in values {
                    encoded.push_str(&value.encode());
                }
                encoded
            }
        }
    }

    /// Builds a command array (`*N` of bulk strings) from its parts.
    pub fn command<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RespValue::Array(
            parts
                .into_iter()
                .map(|part| RespValue::BulkString(part.into()))
                .collect(),
        )
    }

    /// Parses a single-line reply.
    ///
    /// # Arguments
    ///
    /// * `line` - One reply line without its `\r\n` terminator
    ///
    /// # Returns
    ///
    /// * `Ok(RespValue)` - A simple string, error or integer
    /// * `Err(RespError::UnsupportedReply)` - If the line opens a bulk string
    ///   or an array; the declared length is never trusted
    /// * `Err(RespError)` - If the type prefix is unknown or an integer is
    ///   malformed
    pub fn parse_reply(line: &str) -> Result<RespValue, RespError> {
        let Some(prefix) = line.chars().next() else {
            return Err(RespError::UnknownRespType);
        };
        let rest = &line[prefix.len_utf8()..];

        match prefix {
            '+' => Ok(RespValue::SimpleString(rest.to_string())),
            '-' => Ok(RespValue::Error(rest.to_string())),
            ':' => rest
                .parse::<i64>()
                .map(RespValue::Integer)
                .map_err(|_| RespError::FailedToParseInteger),
            '$' | '*' => Err(RespError::UnsupportedReply(line.to_string())),
            _ => Err(RespError::UnknownRespType),
        }
    }
}
