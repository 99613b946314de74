use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    ulr_rs::init_tracing();
    let args = ulr_rs::Args::parse();
    match ulr_rs::run(args) {
        // low 8 bits, as the OS would truncate a raw return code
        Ok(code) => ExitCode::from(code as u8),
        Err(error) => {
            tracing::error!(%error, "hosting failed");
            ExitCode::FAILURE
        }
    }
}
