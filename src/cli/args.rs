// src/cli/args.rs

//! Parsing of `name:key=value,key2=value2` command groups.

use crate::core::commands::CommandInvocation;

/// Parses one command group. Arguments split on `,`, each on its first `=`;
/// `\,` keeps a literal comma inside a value.
pub fn parse_invocation(raw: &str) -> CommandInvocation {
    let (name, rest) = match raw.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (raw, None),
    };
    let args = rest
        .map(|rest| {
            split_unescaped(rest)
                .into_iter()
                .filter(|arg| !arg.is_empty())
                .map(|arg| match arg.split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (arg, None),
                })
                .collect()
        })
        .unwrap_or_default();
    CommandInvocation {
        name: name.trim().to_string(),
        args,
    }
}

/// Parses every command group given on the command line.
pub fn parse_commands(raw: &[String]) -> Vec<CommandInvocation> {
    raw.iter().map(|group| parse_invocation(group)).collect()
}

fn split_unescaped(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}
