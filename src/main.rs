use std::sync::Arc;
use anyhow::Context;
use cardlift::{
    Config, HttpUploadEndpoint, JsonFileLedger, Ledger, MemoryLedger, Orchestrator,
    UploadConfig, UploadEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let file_path = args.next().context("Usage: cardlift <file> <card-id>")?;
    let card_id = args.next().context("Usage: cardlift <file> <card-id>")?;

    let config = Config::load("config.toml")?;
    let endpoint = Arc::new(HttpUploadEndpoint::new(&config.endpoint, &config.token)?);

    let ledger: Arc<dyn Ledger> = match &config.ledger_path {
        Some(path) => Arc::new(JsonFileLedger::load(path).await?),
        None => Arc::new(MemoryLedger::new()),
    };

    let handle = Orchestrator::new(endpoint, ledger, UploadConfig::default());
    let orchestrator = handle.orchestrator.clone();

    let mut events = orchestrator.subscribe_events();
    let upload_id = orchestrator.start(file_path, card_id).await?;

    loop {
        match events.recv().await? {
            UploadEvent::Progress { upload_id: id, uploaded_chunks, total_chunks } if id == upload_id => {
                println!("{}/{} chunks", uploaded_chunks, total_chunks);
            }
            UploadEvent::Completed { upload_id: id, attachment } if id == upload_id => {
                println!("attached: {}", attachment.id);
                break;
            }
            UploadEvent::Failed { upload_id: id, error } if id == upload_id => {
                anyhow::bail!("upload failed: {}", error);
            }
            _ => {}
        }
    }

    handle.shutdown().await?;

    Ok(())
}
