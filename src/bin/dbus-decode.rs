//! Dumps D-Bus messages from a capture.
//!
//! The input is any number of complete messages back to back, as written
//! on the wire. Each is split off using its own length fields and printed.

use clap::Parser;
use dbus_core::codec::bytes_needed;
use dbus_core::error::Result;
use dbus_core::message::Message;
use log::{debug, error};
use std::io::Read;
use std::path::PathBuf;

/// Decode and print binary D-Bus messages
#[derive(Debug, Parser)]
#[command(name = "dbus-decode")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// File holding the messages; standard input when absent
    input: Option<PathBuf>,

    /// Only print how many messages were found
    #[arg(short, long)]
    count: bool,
}

fn read_input(cli: &Cli) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    match &cli.input {
        Some(path) => std::fs::File::open(path)?.read_to_end(&mut data)?,
        None => std::io::stdin().lock().read_to_end(&mut data)?,
    };
    Ok(data)
}

fn decode_all(data: &[u8], print: bool) -> Result<usize> {
    let mut offset = 0;
    let mut count = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let len = bytes_needed(rest)?;
        if len > rest.len() {
            return Err(dbus_core::Error::EndOfInput);
        }
        debug!("message {} at offset {} ({} bytes)", count, offset, len);
        let message = Message::from_blob(&rest[..len], None)?;
        if print {
            println!("Message {}:", count);
            print!("{}", message.print(2));
        }
        offset += len;
        count += 1;
    }
    Ok(count)
}

fn main() {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let result = read_input(&cli).and_then(|data| decode_all(&data, !cli.count));
    match result {
        Ok(count) => {
            if cli.count {
                println!("{}", count);
            }
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
