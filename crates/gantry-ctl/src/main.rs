//! Command-line client for the gantry manager: sends one control frame over
//! the manager socket and prints the reply.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    time::Duration,
};

use clap::{Parser, Subcommand};
use gantry::control::{self, Command};
use gantry_net::framing::{HEADER_SIZE, encode_packet_vec};

#[derive(Parser)]
#[command(name = "gantry-ctl", version, about = "Control a running gantry deployment")]
struct Args {
    /// Manager control socket.
    #[arg(long, default_value = control::DEFAULT_MANAGER_SOCKET)]
    socket: PathBuf,
    /// Reply timeout.
    #[arg(long, default_value = "5s", value_parser = humantime_secs)]
    timeout: Duration,
    #[command(subcommand)]
    command: Cmd,
}

fn humantime_secs(raw: &str) -> Result<Duration, String> {
    // Plain seconds ("5") or humantime ("5s", "500ms").
    raw.parse::<u64>().map_or_else(
        |_| humantime::parse_duration(raw).map_err(|e| e.to_string()),
        |secs| Ok(Duration::from_secs(secs)),
    )
}

#[derive(Subcommand)]
enum Cmd {
    /// Connected-server roster and manager view.
    Status,
    /// Reload scripts on every connected server.
    Reload,
    /// Reopen log files after rotation.
    ReopenLogs,
    /// Gracefully stop every connected server.
    Shutdown,
}

impl Cmd {
    fn command(&self) -> Command {
        match self {
            Self::Status => Command::Status,
            Self::Reload => Command::Reload,
            Self::ReopenLogs => Command::ReopenLogs,
            Self::Shutdown => Command::Shutdown,
        }
    }
}

fn roundtrip(args: &Args) -> std::io::Result<(u32, Vec<u8>)> {
    let mut stream = UnixStream::connect(&args.socket)?;
    stream.set_read_timeout(Some(args.timeout))?;

    stream.write_all(&encode_packet_vec(args.command.command().tag(), b"{}"))?;

    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header[..4].try_into().unwrap()) as usize;
    let tag = u32::from_be_bytes(header[4..8].try_into().unwrap());
    if len < HEADER_SIZE {
        return Err(std::io::ErrorKind::InvalidData.into());
    }
    let mut payload = vec![0u8; len - HEADER_SIZE];
    stream.read_exact(&mut payload)?;
    Ok((tag, payload))
}

fn main() {
    let args = Args::parse();
    match roundtrip(&args) {
        Ok((_, payload)) => {
            // Replies are JSON documents; pretty-print when they parse.
            match serde_json::from_slice::<serde_json::Value>(&payload) {
                Ok(doc) => println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default()),
                Err(_) => println!("{}", String::from_utf8_lossy(&payload)),
            }
        }
        Err(e) => {
            eprintln!("gantry-ctl: {}: {e}", args.socket.display());
            process::exit(1);
        }
    }
}
