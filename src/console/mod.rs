//! Line-oriented console front end: command parsing and event rendering.

use crate::model::{Event, MemoryReport};
use crate::protocol::Command;

pub const HELP: &str = "\
commands:
  connect            scan for the device and connect
  status             print session state
  mem                query free memory (GET_MEM)
  sync               send the local clock (SYNC)
  set <buffer> <hz>  configure buffer size and sample rate (SET)
  fetch              download stored telemetry into a CSV file (FETCH)
  reset              reboot the device (RESET)
  close              disconnect
  help               show this text
  quit               close and exit";

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Status,
    Send(Command),
    Close,
    Help,
    Quit,
}

/// Parses one line of console input. `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "connect" => ConsoleCommand::Connect,
        "status" => ConsoleCommand::Status,
        "mem" => ConsoleCommand::Send(Command::GetMem),
        "sync" => ConsoleCommand::Send(Command::sync_now()),
        "set" => {
            let (Some(buffer), Some(freq), None) = (words.next(), words.next(), words.next())
            else {
                return Err("usage: set <buffer> <hz>".to_string());
            };
            let buffer = buffer
                .parse()
                .map_err(|_| format!("invalid buffer size {buffer}"))?;
            let freq = freq
                .parse()
                .map_err(|_| format!("invalid sample rate {freq}"))?;
            let command = Command::configure(buffer, freq).map_err(|err| err.to_string())?;
            ConsoleCommand::Send(command)
        }
        "fetch" => ConsoleCommand::Send(Command::Fetch),
        "reset" => ConsoleCommand::Send(Command::Reset),
        "close" => ConsoleCommand::Close,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command {other}, try `help`")),
    };
    Ok(Some(command))
}

/// One-line terminal rendering of an event.
pub fn render(event: &Event) -> String {
    match event {
        Event::Ack { kind } => format!("ack      {kind}"),
        Event::BlockWait { block } => format!("block    {block} received, acknowledged"),
        Event::EndOfStream => "end      transfer finished".to_string(),
        Event::MemoryReport(MemoryReport {
            raw,
            samples_that_fit,
            ..
        }) => match samples_that_fit {
            Some(samples) => format!("memory   {raw} (~{samples} samples)"),
            None => format!("memory   {raw}"),
        },
        Event::Status(status) => format!(
            "{:<8} {}",
            format!("{:?}", status.kind).to_lowercase(),
            status.message
        ),
        Event::DataRecord { fields } => format!("record   {}", fields.join(",")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, StatusKind};

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_line("  connect "), Ok(Some(ConsoleCommand::Connect)));
        assert_eq!(
            parse_line("MEM"),
            Ok(Some(ConsoleCommand::Send(Command::GetMem)))
        );
        assert_eq!(
            parse_line("fetch"),
            Ok(Some(ConsoleCommand::Send(Command::Fetch)))
        );
        assert_eq!(parse_line("quit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn set_validates_arguments() {
        assert_eq!(
            parse_line("set 100 2"),
            Ok(Some(ConsoleCommand::Send(Command::Set {
                buffer: 100,
                freq: 2
            })))
        );
        assert!(parse_line("set 100").is_err());
        assert!(parse_line("set 100 2 3").is_err());
        assert!(parse_line("set abc 2").is_err());
        assert!(parse_line("set 5000 2").is_err());
        assert!(parse_line("set 100 11").is_err());
    }

    #[test]
    fn help_describes_reset_as_a_reboot() {
        let reset = HELP
            .lines()
            .find(|line| line.trim_start().starts_with("reset"))
            .unwrap();
        assert!(reset.contains("reboot"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse_line("launch").is_err());
    }

    #[test]
    fn renders_events_for_the_terminal() {
        assert_eq!(
            render(&Event::BlockWait {
                block: BlockId::new("3")
            }),
            "block    3 received, acknowledged"
        );
        assert_eq!(
            render(&Event::status(StatusKind::NotConnected, "connect first")),
            "notconnected connect first"
        );
        assert_eq!(
            render(&Event::DataRecord {
                fields: vec!["1.5".into(), "1".into(), "2".into(), "3".into()]
            }),
            "record   1.5,1,2,3"
        );
    }
}
