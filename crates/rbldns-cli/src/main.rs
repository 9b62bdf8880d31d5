//! rbldnsd - DNSBL daemon

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match rbldns_cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rbldnsd: {e:#}");
            ExitCode::FAILURE
        }
    }
}
