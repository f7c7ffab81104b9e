#[tokio::main]
async fn main() -> anyhow::Result<()> {
    compliance_ledger::server::run().await
}
