//! Interactive shared-memory blocklist writer.
//!
//! Reads one command per line from stdin:
//! `+A` insert the IP or CIDR `A`, `-A` remove it, `!` clear, `b` begin a
//! batch, `B` commit it, `q` quit.

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;

use ip_blocker::{Error, Server};

#[derive(Parser, Debug)]
#[command(name = "ip-blocker-agent")]
#[command(about = "Shared-memory IP blocklist writer")]
struct Args {
    /// Shared memory name; must begin with '/'.
    #[arg(long, default_value = "/ip-blocker")]
    name: String,

    /// Permissions of the shared memory object, octal.
    #[arg(long, default_value = "600", value_parser = parse_octal)]
    perms: u32,

    /// Optional subcommand: `unlink` removes the segment and exits.
    command: Option<String>,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|err| err.to_string())
}

fn print_counts(server: &Server) {
    match server.count() {
        Ok((ip4, ip6, ip6r)) => println!("IP4: {ip4}, IP6: {ip6}, IP6 routes: {ip6r}"),
        Err(err) => eprintln!("count failed: {err}"),
    }
}

/// Parse `addr/prefix` or a bare address into the core's range form.
fn parse_target(s: &str) -> Option<(IpAddr, Option<u8>)> {
    match s.split_once('/') {
        Some((addr, prefix)) => {
            let ip: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            (prefix <= max).then_some((ip, Some(prefix)))
        }
        None => Some((s.parse().ok()?, None)),
    }
}

fn main() -> ExitCode {
    env_logger::builder().format_timestamp(None).init();
    let args = Args::parse();

    if let Some(command) = args.command.as_deref() {
        if command != "unlink" {
            eprintln!("usage: ip-blocker-agent [--name <path>] [--perms <octal>] [unlink]");
            return ExitCode::FAILURE;
        }
        return match ip_blocker::unlink(&args.name) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::FAILURE
            }
        };
    }

    let server = match Server::new(&args.name, args.perms) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    print_counts(&server);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                eprintln!("stdin: {err}");
                return ExitCode::FAILURE;
            }
        };
        if line.is_empty() || !line.is_char_boundary(1) {
            println!("invalid input: {line}");
            continue;
        }

        let (op, rest) = line.split_at(1);
        match op {
            "+" | "-" => {
                let Some((ip, prefix)) = parse_target(rest) else {
                    println!("invalid ip address or cidr: {rest}");
                    continue;
                };
                let insert = op == "+";
                let result = match (insert, prefix) {
                    (true, Some(prefix)) => server.insert_range(ip, prefix),
                    (false, Some(prefix)) => server.remove_range(ip, prefix),
                    (true, None) => server.insert(ip),
                    (false, None) => server.remove(ip),
                };
                match result {
                    Ok(()) => {
                        if !server.is_batching() {
                            print_counts(&server);
                        }
                    }
                    Err(err) => eprintln!("{err}"),
                }
            }
            "!" if rest.is_empty() => match server.clear() {
                Ok(()) => {
                    if !server.is_batching() {
                        print_counts(&server);
                    }
                }
                Err(err) => eprintln!("{err}"),
            },
            "b" if rest.is_empty() => match server.batch() {
                Ok(()) => {}
                Err(err @ Error::AlreadyBatching) => println!("{err}"),
                Err(err) => eprintln!("{err}"),
            },
            "B" if rest.is_empty() => match server.commit() {
                Ok(()) => print_counts(&server),
                Err(err @ Error::NotBatching) => println!("{err}"),
                Err(err) => eprintln!("{err}"),
            },
            "q" | "Q" if rest.is_empty() => break,
            _ => println!("invalid operation: {line}"),
        }
    }

    if let Err(err) = server.unlink() {
        eprintln!("{err}");
    }
    ExitCode::SUCCESS
}
