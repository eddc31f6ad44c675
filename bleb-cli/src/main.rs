//! blebtool - command-line front end over a bleb repository.
//!
//! Usage: blebtool <COMMAND> [ARGS]

use std::io::{Read, Write};
use std::process::ExitCode;

use bleb_core::{put_flags, Repository};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }

    let command = args[1].as_str();
    let cmd_args: Vec<&str> = args[2..].iter().map(|s| s.as_str()).collect();

    let result = match command {
        "get" => run_get(&cmd_args),
        "put" => run_put(&cmd_args),
        "merge" => run_merge(&cmd_args),
        "help" | "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            Err("unknown command".to_string())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("blebtool: {e}");
            ExitCode::from(1)
        }
    }
}

fn print_usage() {
    println!("blebtool - inspect and edit bleb repositories");
    println!();
    println!("USAGE:");
    println!("    blebtool get <name> -R <repo> [-o <outfile>]");
    println!("    blebtool put <name> -R <repo> [-i <infile>] [-T <text>] [--no-inline]");
    println!("    blebtool merge <source> -R <dest> [-p <prefix>]");
}

/// Parses `-flag value` / `--flag value` pairs and a single `--no-inline`
/// boolean switch out of a flat argument slice, the same shape blebtool's
/// original reflection-driven parser accepted.
struct ParsedArgs<'a> {
    positional: Vec<&'a str>,
    repo: Option<&'a str>,
    outfile: Option<&'a str>,
    infile: Option<&'a str>,
    text: Option<&'a str>,
    prefix: Option<&'a str>,
    no_inline: bool,
}

fn parse_args<'a>(args: &[&'a str]) -> Result<ParsedArgs<'a>, String> {
    let mut parsed = ParsedArgs {
        positional: Vec::new(),
        repo: None,
        outfile: None,
        infile: None,
        text: None,
        prefix: None,
        no_inline: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "-R" => {
                i += 1;
                parsed.repo = Some(*args.get(i).ok_or("-R requires a repository path")?);
            }
            "-o" => {
                i += 1;
                parsed.outfile = Some(*args.get(i).ok_or("-o requires a path")?);
            }
            "-i" => {
                i += 1;
                parsed.infile = Some(*args.get(i).ok_or("-i requires a path")?);
            }
            "-T" => {
                i += 1;
                parsed.text = Some(*args.get(i).ok_or("-T requires a value")?);
            }
            "-p" => {
                i += 1;
                parsed.prefix = Some(*args.get(i).ok_or("-p requires a value")?);
            }
            "--no-inline" => parsed.no_inline = true,
            other => parsed.positional.push(other),
        }
        i += 1;
    }

    Ok(parsed)
}

fn run_get(args: &[&str]) -> Result<(), String> {
    let parsed = parse_args(args)?;
    let name = *parsed.positional.first().ok_or("get requires <name>")?;
    let repo_path = parsed.repo.ok_or("get requires -R <repo>")?;

    let mut repo = Repository::open_file(repo_path).map_err(|e| e.to_string())?;
    let contents = repo.get(name.as_bytes()).map_err(|e| e.to_string())?;
    let Some(contents) = contents else {
        return Err(format!("no such object: {name}"));
    };

    match parsed.outfile {
        Some(path) => std::fs::write(path, &contents).map_err(|e| e.to_string())?,
        None => std::io::stdout().write_all(&contents).map_err(|e| e.to_string())?,
    }
    Ok(())
}

fn run_put(args: &[&str]) -> Result<(), String> {
    let parsed = parse_args(args)?;
    let name = *parsed.positional.first().ok_or("put requires <name>")?;
    let repo_path = parsed.repo.ok_or("put requires -R <repo>")?;

    let contents: Vec<u8> = if let Some(text) = parsed.text {
        text.as_bytes().to_vec()
    } else if let Some(path) = parsed.infile {
        std::fs::read(path).map_err(|e| e.to_string())?
    } else {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).map_err(|e| e.to_string())?;
        buf
    };

    let flags = if parsed.no_inline { 0 } else { put_flags::PREFER_INLINE_PAYLOAD };

    let mut repo = Repository::open_file(repo_path).map_err(|e| e.to_string())?;
    repo.put(name.as_bytes(), &contents, flags).map_err(|e| e.to_string())?;
    repo.close().map_err(|e| e.to_string())
}

fn run_merge(args: &[&str]) -> Result<(), String> {
    let parsed = parse_args(args)?;
    let source_path = *parsed.positional.first().ok_or("merge requires <source>")?;
    let dest_path = parsed.repo.ok_or("merge requires -R <dest>")?;
    let prefix = parsed.prefix.unwrap_or("");

    let mut source = Repository::open_file(source_path).map_err(|e| e.to_string())?;
    let mut dest = Repository::open_file(dest_path).map_err(|e| e.to_string())?;

    let names = source.enumerate().map_err(|e| e.to_string())?;
    for name in names {
        let contents = source
            .get(&name)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "object vanished during merge".to_string())?;

        let mut dest_name = prefix.as_bytes().to_vec();
        dest_name.extend_from_slice(&name);

        let flags = if contents.len() < 256 { put_flags::PREFER_INLINE_PAYLOAD } else { 0 };
        dest.put(&dest_name, &contents, flags).map_err(|e| e.to_string())?;
    }

    dest.close().map_err(|e| e.to_string())
}
