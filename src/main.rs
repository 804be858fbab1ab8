use anyhow::Result;
use clap::Parser;

use wsload::client;
use wsload::config::Cli;
use wsload::generator::Generator;
use wsload::metrics::{LogBuffer, WallClock};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = cli.run_config()?;

    if cli.perf {
        // In load mode every log line goes through the shared buffer so the
        // dashboard can fold errors into its table.
        let logs = LogBuffer::default();
        let writer = logs.clone();
        init_tracing(move || writer.clone());

        let generator = Generator::new(cfg).await?;
        generator.run(logs).await
    } else {
        init_tracing(std::io::stderr);
        client::run(&cfg, &cli.execute, cli.wait).await
    }
}

fn init_tracing<W>(writer: W)
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_timer(WallClock)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
}
