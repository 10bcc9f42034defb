#[tokio::main]
async fn main() -> anyhow::Result<()> {
    netwall_analyzer::run().await
}
