#[tokio::main]
async fn main() -> eyre::Result<()> {
    relaymq::run().start().await
}
