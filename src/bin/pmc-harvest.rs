use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    pmc_harvest::cli::run().await
}
