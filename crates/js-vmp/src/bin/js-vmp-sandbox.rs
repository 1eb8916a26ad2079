//! Sandbox worker: reads one JSON request on stdin, runs it in a fresh
//! realm and writes the outcome to stdout.

use std::io;

fn usage() -> &'static str {
    "Usage: js-vmp-sandbox < request.json > outcome.json"
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    if std::env::args().skip(1).any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", usage());
        return Ok(());
    }
    js_vmp::sandbox::serve_worker(io::stdin().lock(), io::stdout().lock())
}
