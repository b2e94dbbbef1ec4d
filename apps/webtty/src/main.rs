use webtty_core::terminal::{app, cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::parse();
    app::run(cli).await?;
    Ok(())
}
