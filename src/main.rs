/// To build distributable binary (WIP):
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// cargo build --release --target=x86_64-unknown-linux-musl --features tss-esapi
/// ```
use eyre::Result;
use std::env;
use tpm_attestation::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
