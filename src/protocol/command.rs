use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;

use crate::errors::CommandError;
use crate::protocol::resp::RESP;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PING,
    ECHO,
    // storage commands
    SET,
    GET,
    DEL,
    INCR,
    TYPE,
    KEYS,
    // transactions
    MULTI,
    EXEC,
    DISCARD,
    // stream commands
    XADD,
    XRANGE,
    XREAD,
    // replication commands
    PSYNC,
    INFO,
    REPLCONF,
    WAIT,
    CONFIG,
}

impl Command {
    /** command mutates the local storage and is propagated to replicas */
    pub fn is_mutating(&self) -> bool {
        matches!(self, Command::SET | Command::DEL)
    }

    /** command writes the keyspace; replicas refuse these from clients */
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::SET | Command::DEL | Command::INCR | Command::XADD
        )
    }

    pub fn parse_command(message: &RESP) -> anyhow::Result<(Command, Vec<String>)> {
        if let RESP::Array(array) = message {
            if array.iter().all(|x| matches!(x, RESP::Bulk(_))) {
                let strings = array.iter().map(|r| r.to_string()).collect::<Vec<String>>();
                if let [command, params @ ..] = &strings[..] {
                    let cmd = command.parse::<Command>()?;
                    return Ok((cmd, params.to_vec()));
                }
            }
        }
        bail!("message is not a valid command: {}", message)
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Command, Self::Err> {
        match input.to_uppercase().as_str() {
            "PING" => Ok(Command::PING),
            "ECHO" => Ok(Command::ECHO),
            "SET" => Ok(Command::SET),
            "GET" => Ok(Command::GET),
            "DEL" => Ok(Command::DEL),
            "INCR" => Ok(Command::INCR),
            "TYPE" => Ok(Command::TYPE),
            "KEYS" => Ok(Command::KEYS),
            "MULTI" => Ok(Command::MULTI),
            "EXEC" => Ok(Command::EXEC),
            "DISCARD" => Ok(Command::DISCARD),
            "XADD" => Ok(Command::XADD),
            "XRANGE" => Ok(Command::XRANGE),
            "XREAD" => Ok(Command::XREAD),
            "PSYNC" => Ok(Command::PSYNC),
            "INFO" => Ok(Command::INFO),
            "REPLCONF" => Ok(Command::REPLCONF),
            "WAIT" => Ok(Command::WAIT),
            "CONFIG" => Ok(Command::CONFIG),
            _ => Err(CommandError::Unknown(input.to_string())),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::PING => "PING",
            Command::ECHO => "ECHO",
            Command::SET => "SET",
            Command::GET => "GET",
            Command::DEL => "DEL",
            Command::INCR => "INCR",
            Command::TYPE => "TYPE",
            Command::KEYS => "KEYS",
            Command::MULTI => "MULTI",
            Command::EXEC => "EXEC",
            Command::DISCARD => "DISCARD",
            Command::XADD => "XADD",
            Command::XRANGE => "XRANGE",
            Command::XREAD => "XREAD",
            Command::PSYNC => "PSYNC",
            Command::INFO => "INFO",
            Command::REPLCONF => "REPLCONF",
            Command::WAIT => "WAIT",
            Command::CONFIG => "CONFIG",
        };
        write!(f, "{}", name)
    }
}
