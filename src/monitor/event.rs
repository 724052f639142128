//! Decoded MONITOR log entries and the events a hub hands to observers.
//!
//! A MONITOR line looks like:
//!
//! ```text
//! 1339518083.107412 [0 127.0.0.1:60866] "keys" "*"
//! ```
//!
//! i.e. a server timestamp, the logical database and client address in
//! brackets, then the command and its arguments as quoted, escaped strings.

use serde::Serialize;

/// Database index carried by an event whose line failed structured parsing.
pub const MALFORMED_DATABASE: i64 = -1;

/// Timestamp carried by an event whose line failed structured parsing.
pub const MALFORMED_TIMESTAMP: f64 = 0.0;

/// One command-log entry reported by the upstream instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorEvent {
    #[serde(rename = "time")]
    timestamp: f64,
    database: i64,
    source: String,
    #[serde(rename = "args")]
    arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

impl MonitorEvent {
    pub fn new(timestamp: f64, database: i64, source: String, arguments: Vec<String>) -> Self {
        Self {
            timestamp,
            database,
            source,
            arguments,
            raw: None,
        }
    }

    /// Wraps a line that does not follow the MONITOR grammar. Every field but
    /// `raw` holds its sentinel value.
    pub fn malformed(raw: &str) -> Self {
        Self {
            timestamp: MALFORMED_TIMESTAMP,
            database: MALFORMED_DATABASE,
            source: String::new(),
            arguments: Vec::new(),
            raw: Some(raw.to_string()),
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn is_malformed(&self) -> bool {
        self.raw.is_some()
    }
}

/// Element of a batch pushed to an observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HubEvent {
    Command(MonitorEvent),
    Exception {
        #[serde(rename = "isError")]
        is_error: bool,
        message: String,
    },
}

impl HubEvent {
    pub fn exception(message: impl Into<String>) -> Self {
        HubEvent::Exception {
            is_error: true,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, HubEvent::Exception { .. })
    }

    pub fn as_command(&self) -> Option<&MonitorEvent> {
        match self {
            HubEvent::Command(event) => Some(event),
            HubEvent::Exception { .. } => None,
        }
    }

    /// Serializes the event into its cross-boundary JSON shape.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<MonitorEvent> for HubEvent {
    fn from(event: MonitorEvent) -> Self {
        HubEvent::Command(event)
    }
}

/// Decodes one MONITOR line (without the leading `+`).
///
/// Lines that do not match the grammar are never dropped: they come back as
/// [`MonitorEvent::malformed`] so observers still see them.
pub fn parse_monitor_line(line: &str) -> MonitorEvent {
    parse_structured(line).unwrap_or_else(|| MonitorEvent::malformed(line))
}

fn parse_structured(line: &str) -> Option<MonitorEvent> {
    let (timestamp, rest) = line.split_once(' ')?;
    let timestamp = timestamp.parse::<f64>().ok().filter(|t| t.is_finite())?;

    let rest = rest.strip_prefix('[')?;
    let (client, rest) = rest.split_once("] ")?;
    let (database, source) = client.split_once(' ')?;
    let database = database.parse::<i64>().ok()?;

    if source.is_empty() {
        return None;
    }

    let arguments = parse_arguments(rest)?;
    if arguments.is_empty() {
        return None;
    }

    Some(MonitorEvent::new(
        timestamp,
        database,
        source.to_string(),
        arguments,
    ))
}

/// Splits the quoted argument list, undoing the server's escaping.
fn parse_arguments(input: &str) -> Option<Vec<String>> {
    let bytes = input.as_bytes();
    let mut index = 0;
    let mut arguments = Vec::new();

    loop {
        while index < bytes.len() && bytes[index] == b' ' {
            index += 1;
        }

        if index == bytes.len() {
            break;
        }

        if bytes[index] != b'"' {
            return None;
        }
        index += 1;

        let mut current = Vec::new();
        let mut closed = false;

        while index < bytes.len() {
            match bytes[index] {
                b'\\' => {
                    let escaped = *bytes.get(index + 1)?;
                    match escaped {
                        b'n' => current.push(b'\n'),
                        b'r' => current.push(b'\r'),
                        b't' => current.push(b'\t'),
                        b'a' => current.push(0x07),
                        b'b' => current.push(0x08),
                        b'x' => {
                            // Exactly two hex digits, no sign.
                            let hex = bytes.get(index + 2..index + 4)?;
                            if !hex.iter().all(u8::is_ascii_hexdigit) {
                                return None;
                            }
                            let hex = std::str::from_utf8(hex).ok()?;
                            current.push(u8::from_str_radix(hex, 16).ok()?);
                            index += 2;
                        }
                        other => current.push(other),
                    }
                    index += 2;
                }
                b'"' => {
                    closed = true;
                    index += 1;
                    break;
                }
                byte => {
                    current.push(byte);
                    index += 1;
                }
            }
        }

        if !closed {
            return None;
        }

        if index < bytes.len() && bytes[index] != b' ' {
            return None;
        }

        arguments.push(String::from_utf8_lossy(&current).into_owned());
    }

    Some(arguments)
}
