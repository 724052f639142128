use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CliError {
    #[error("Invalid command line flag: {0}")]
    InvalidCommandLineFlag(String),
    #[error("Invalid command line flag value for {0}")]
    InvalidCommandLineFlagValue(String),
}

/// Credentials and address of one monitored Redis instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectionParams {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379)
    }
}

/// Tuning shared by every hub of a directory.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// A pending batch is flushed as soon as it holds this many events.
    pub max_batch_events: usize,
    /// Longest time an event waits in a pending batch.
    pub debounce: Duration,
    /// Pushes slower than this count as a disconnected observer.
    pub push_timeout: Duration,
    /// Bound on opening the upstream connection.
    pub connect_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_batch_events: 256,
            debounce: Duration::from_millis(50),
            push_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of the `redis-monitor` binary.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub instance_id: String,
    pub connection: ConnectionParams,
    pub hub: HubConfig,
}

impl MonitorConfig {
    /// Parses command line arguments; the first item is the program name.
    ///
    /// Recognized flags: `--host`, `--port`, `--user`, `--password`,
    /// `--instance-id`, `--batch-size`, `--debounce-ms` and
    /// `--push-timeout-ms`.
    pub fn new<I: IntoIterator<Item = String>>(command_line_args: I) -> Result<Self, CliError> {
        let mut iter = command_line_args.into_iter().skip(1);
        let mut connection = ConnectionParams::default();
        let mut hub = HubConfig::default();
        let mut instance_id: Option<String> = None;

        while let Some(arg) = iter.next() {
            let Some(value) = iter.next() else {
                return match arg.as_str() {
                    "--host" | "--port" | "--user" | "--password" | "--instance-id"
                    | "--batch-size" | "--debounce-ms" | "--push-timeout-ms" => {
                        Err(CliError::InvalidCommandLineFlagValue(arg))
                    }
                    _ => Err(CliError::InvalidCommandLineFlag(arg)),
                };
            };

            match arg.as_str() {
                "--host" => {
                    if value.is_empty() {
                        return Err(CliError::InvalidCommandLineFlagValue(arg));
                    }
                    connection.host = value;
                }
                "--port" => {
                    let port_number = value
                        .parse::<u16>()
                        .map_err(|_| CliError::InvalidCommandLineFlagValue(arg.clone()))?;

                    if port_number < 1 {
                        return Err(CliError::InvalidCommandLineFlagValue(arg));
                    }

                    connection.port = port_number;
                }
                "--user" => connection.username = Some(value),
                "--password" => connection.password = Some(value),
                "--instance-id" => instance_id = Some(value),
                "--batch-size" => {
                    hub.max_batch_events = parse_positive(&arg, &value)? as usize;
                }
                "--debounce-ms" => {
                    hub.debounce = Duration::from_millis(parse_positive(&arg, &value)?);
                }
                "--push-timeout-ms" => {
                    hub.push_timeout = Duration::from_millis(parse_positive(&arg, &value)?);
                }
                _ => return Err(CliError::InvalidCommandLineFlag(arg)),
            }
        }

        Ok(MonitorConfig {
            instance_id: instance_id.unwrap_or_else(|| connection.address()),
            connection,
            hub,
        })
    }
}

fn parse_positive(flag: &str, value: &str) -> Result<u64, CliError> {
    match value.parse::<u64>() {
        Ok(number) if number > 0 => Ok(number),
        _ => Err(CliError::InvalidCommandLineFlagValue(flag.to_string())),
    }
}
