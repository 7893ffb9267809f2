//! Line commands read from standard input.

use crate::{
    event::{Event, EventBus},
    session::SessionAction,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Hangup,
    Quit,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

    match word {
        "call" | "c" => Some(Command::Call(rest.trim().to_string())),
        "hangup" | "stop" | "h" => Some(Command::Hangup),
        "quit" | "exit" | "q" => Some(Command::Quit),
        _ => None,
    }
}

/// Forwards commands to the bus until `quit` or end of input.
pub async fn run(bus: &EventBus) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error while reading stdin: {e}");
                break;
            }
        };

        match parse_command(&line) {
            Some(Command::Call(number)) => {
                bus.send(Event::Session(SessionAction::Start { number }));
            }
            Some(Command::Hangup) => bus.send(Event::Session(SessionAction::Stop)),
            Some(Command::Quit) => break,
            None if line.trim().is_empty() => {}
            None => println!("Commands: call <number>, hangup, quit"),
        }
    }
}
