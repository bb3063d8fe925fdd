//! Shared-memory blocklist query tool.
//!
//! With an IP argument, exits 0 if the address is blocked and 1 if not,
//! printing nothing. Without one, reads one IP per line from stdin and
//! prints `true`/`false`; `?` prints a status line, `q` quits.

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;

use ip_blocker::Client;

#[derive(Parser, Debug)]
#[command(name = "ip-blocker-client")]
#[command(about = "Shared-memory IP blocklist query tool")]
struct Args {
    /// Shared memory name; must begin with '/'.
    #[arg(long, default_value = "/ip-blocker")]
    name: String,

    /// Query a single address and report via the exit code.
    ip: Option<IpAddr>,
}

fn print_status(client: &Client) {
    match client.count() {
        Ok((ip4, ip6, ip6r)) => println!("IP4: {ip4}, IP6: {ip6}, IP6 routes: {ip6r}"),
        Err(err) => eprintln!("count failed: {err}"),
    }
}

fn main() -> ExitCode {
    env_logger::builder().format_timestamp(None).init();
    let args = Args::parse();

    let client = match Client::open(&args.name) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    if let Some(ip) = args.ip {
        return match client.contains(ip) {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(2)
            }
        };
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("stdin: {err}");
                return ExitCode::from(2);
            }
        };
        match line.as_str() {
            "" => println!("invalid input"),
            "q" | "Q" => break,
            "?" => print_status(&client),
            _ => match line.parse::<IpAddr>() {
                Ok(ip) => match client.contains(ip) {
                    Ok(blocked) => println!("{blocked}"),
                    Err(err) => eprintln!("{err}"),
                },
                Err(_) => println!("invalid ip address: {line}"),
            },
        }
    }

    ExitCode::SUCCESS
}
