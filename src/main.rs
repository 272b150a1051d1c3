use clap::Parser;
use wasm_site_bundler::cli::{self, Cli};

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_max_level(cli.log_level())
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();

  match cli::run(cli).await {
    Ok(true) => {}
    Ok(false) => std::process::exit(1),
    Err(e) => {
      eprintln!("Error: {e}");

      // Print the error chain
      for cause in e.chain().skip(1) {
        eprintln!("Caused by: {cause}");
      }

      std::process::exit(1);
    }
  }
}
