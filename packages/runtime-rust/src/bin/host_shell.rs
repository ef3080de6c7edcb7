//! Line-oriented stand-in for a host process.
//!
//! Reads requests from stdin, one per line:
//!
//! ```text
//! Add 10 10
//! Add|42 10 10
//! String "hello world"
//! Array 1 [2,"x"] 3
//! ASYNC_CANCEL|<token>
//! :version
//! :quit
//! ```
//!
//! Prints `REPLY <code> <text>` for each request and `CALLBACK <ext> <tag>
//! <body>` for every asynchronous delivery.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use extcall_runtime::service::{DeliveryError, DemoPlugin, HostCallback, TracingObserver};
use extcall_runtime::{logging, Bridge, BridgeConfig};

#[derive(Parser, Debug)]
#[command(name = "host-shell", about = "Drive the demo extension from stdin")]
struct Cli {
    /// JSON config file; missing fields use defaults
    #[arg(long, env = "EXTCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, env = "EXTCALL_JSON_LOGS")]
    json_logs: bool,

    /// Reply buffer size in bytes (overrides the config file)
    #[arg(long, env = "EXTCALL_BUFFER")]
    buffer: Option<usize>,
}

struct StdoutCallback;

impl HostCallback for StdoutCallback {
    fn deliver(&self, extension: &str, function: &str, data: &str) -> Result<(), DeliveryError> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "CALLBACK {extension} {function} {data}")
            .and_then(|()| stdout.flush())
            .map_err(|err| DeliveryError::Rejected(err.to_string()))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    if cli.json_logs {
        config.log.json = true;
    }
    if let Some(buffer) = cli.buffer {
        config.output_capacity = buffer;
    }
    logging::init(&config.log);

    let capacity = config.output_capacity.max(1);
    let version = config.version.clone();
    let bridge = Bridge::builder(config)
        .plugin(DemoPlugin::new(version))
        .observer(Arc::new(TracingObserver))
        .callback(Arc::new(StdoutCallback))
        .build()?;

    let mut out = vec![0u8; capacity];
    bridge.version(&mut out);
    println!("VERSION {}", reply_text(&out));

    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = tokenize(line).into_iter();
        let Some(function) = tokens.next() else {
            continue;
        };
        match function.as_str() {
            ":quit" => break,
            ":version" => {
                bridge.version(&mut out);
                println!("VERSION {}", reply_text(&out));
            }
            _ => {
                let args: Vec<String> = tokens.collect();
                let code = bridge.call_with_args(&function, &args, &mut out);
                println!("REPLY {} {}", code.as_i32(), reply_text(&out));
            }
        }
    }

    Ok(())
}

/// Text up to the NUL terminator.
fn reply_text(out: &[u8]) -> String {
    let len = out.iter().position(|b| *b == 0).unwrap_or(out.len());
    String::from_utf8_lossy(&out[..len]).into_owned()
}

/// Splits on whitespace outside of double quotes and brackets. Quotes are
/// kept so the argument codec still sees quoted text.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut depth = 0usize;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ']' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keeps_quotes_and_brackets_together() {
        assert_eq!(
            tokenize(r#"Array 1 [2, "a b"] "x y" 3"#),
            vec!["Array", "1", r#"[2, "a b"]"#, r#""x y""#, "3"]
        );
    }

    #[test]
    fn tokenize_handles_doubled_quotes() {
        assert_eq!(
            tokenize(r#"String "say ""hi"" now""#),
            vec!["String", r#""say ""hi"" now""#]
        );
    }

    #[test]
    fn reply_text_stops_at_terminator() {
        assert_eq!(reply_text(b"abc\0zzz"), "abc");
        assert_eq!(reply_text(b"abc"), "abc");
    }
}
