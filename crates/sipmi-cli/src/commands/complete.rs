//! `sipmi complete`: words for shell completion scripts.
//!
//! Without a word, prints every option of the command followed by what the
//! server offers (`which` for `mi`, `events_list` for `event`). With an
//! option name, prints that option's choices.

use clap::{Arg, CommandFactory};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, CompleteTarget};
use crate::commands::build_client;
use crate::commands::mi::{MiRequest, execute};
use crate::config::MiSettings;
use crate::error::{CliError, CliResult};

pub async fn run(settings: &MiSettings, target: &CompleteTarget) -> CliResult<()> {
    let (command, word) = match target {
        CompleteTarget::Mi { word } => ("mi", word.as_deref()),
        CompleteTarget::Event { word } => ("event", word.as_deref()),
    };

    if let Some(word) = word.filter(|w| !w.is_empty()) {
        let values = choices(command, word);
        if !values.is_empty() {
            println!("{}", values.join(" "));
        }
        return Ok(());
    }

    println!("{}", option_strings(command).join(" "));

    let method = if command == "mi" { "which" } else { "events_list" };
    let request = MiRequest {
        method: method.to_string(),
        params: None,
    };
    let reply = match build_client(settings) {
        Ok(mi) => execute(mi, request).await,
        Err(e) => Err(e),
    };
    match reply {
        Ok(reply) => {
            let names = if command == "mi" {
                command_names(&reply)
            } else {
                event_names(&reply)
            };
            println!("{}", names.join(" "));
            Ok(())
        }
        Err(e) => {
            debug!(error = %e, "Could not list completions from the server");
            Err(CliError::Silent)
        }
    }
}

/// Every `-x` and `--long` option accepted by `sipmi <command>`, globals
/// included.
pub fn option_strings(command: &str) -> Vec<String> {
    let mut options = Vec::new();
    for arg in arguments(command) {
        if let Some(short) = arg.get_short() {
            options.push(format!("-{}", short));
        }
        if let Some(long) = arg.get_long() {
            options.push(format!("--{}", long));
        }
    }
    options
}

/// Possible values of the option named `word`. One letter means the short
/// form; leading dashes are ignored.
pub fn choices(command: &str, word: &str) -> Vec<String> {
    let name = word.trim_start_matches('-');
    let mut short = name.chars();
    let short = match (short.next(), short.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    };

    arguments(command)
        .into_iter()
        .find(|arg| match short {
            Some(c) => arg.get_short() == Some(c),
            None => arg.get_long() == Some(name),
        })
        .map(|arg| {
            arg.get_possible_values()
                .into_iter()
                .filter(|value| !value.is_hide_set())
                .map(|value| value.get_name().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn arguments(command: &str) -> Vec<Arg> {
    let mut root = Cli::command();
    root.build();

    let mut args: Vec<Arg> = Vec::new();
    let sub_args = root
        .find_subcommand(command)
        .map(|sub| sub.get_arguments().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for arg in root.get_arguments().cloned().chain(sub_args) {
        if arg.is_hide_set() || args.iter().any(|known| known.get_id() == arg.get_id()) {
            continue;
        }
        args.push(arg);
    }
    args
}

/// Command names from a `which` reply.
fn command_names(reply: &Value) -> Vec<String> {
    reply
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Event names from an `events_list` reply.
fn event_names(reply: &Value) -> Vec<String> {
    reply
        .get("Events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(|event| event.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
