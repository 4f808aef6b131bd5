#[tokio::main]
async fn main() -> anyhow::Result<()> {
    feedwatch_lib::run().await
}
