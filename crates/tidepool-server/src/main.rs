use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tidepool_server::logging::init();
    let config = tidepool_server::load_config()?;
    tidepool_server::run(config).await
}
