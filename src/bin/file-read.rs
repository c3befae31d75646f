//! Fetch one file from a worker's file server.
//!
//! ```text
//! file-read <host> <port> <database> <file> <out-path>
//! ```
//!
//! Prints the transferred byte count and the source mtime on success. Used
//! for smoke-testing file servers and as a manual recovery tool.

use std::io::Write;
use std::process::ExitCode;

use replica_worker::fileclient::FileClient;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [host, port, database, file, out_path] = args.as_slice() else {
        eprintln!("usage: file-read <host> <port> <database> <file> <out-path>");
        return ExitCode::FAILURE;
    };
    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(e) => {
            eprintln!("bad port '{port}': {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut client = match FileClient::open(host, port, database, file) {
        Ok(Some(client)) => client,
        Ok(None) => {
            eprintln!("file '{file}' of database '{database}' is not available on {host}:{port}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("failed to open '{file}' of database '{database}' on {host}:{port}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut out = match std::fs::File::create(out_path) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("failed to create '{out_path}': {e}");
            return ExitCode::FAILURE;
        }
    };

    let expected = client.size();
    let mut buf = vec![0_u8; 1024 * 1024];
    let mut total: u64 = 0;
    loop {
        let num = match client.read(&mut buf) {
            Ok(0) => break,
            Ok(num) => num,
            Err(e) => {
                eprintln!("read failed after {total} bytes: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = out.write_all(&buf[..num]) {
            eprintln!("write failed after {total} bytes: {e}");
            return ExitCode::FAILURE;
        }
        total += num as u64;
    }
    if total != expected {
        eprintln!("short transfer: {total} of {expected} bytes");
        return ExitCode::FAILURE;
    }
    println!("{total} bytes, mtime {}", client.mtime());
    ExitCode::SUCCESS
}
