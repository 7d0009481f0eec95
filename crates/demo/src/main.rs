use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use leasehold_core::{ObjectId, ProcessableObject, ProcessingPhase, ProcessingStatus};
use leasehold_demo::mail::{MailStatus, Message, Outbox};
use leasehold_demo::thumbnails::{ImageStatus, Thumbnailer};
use leasehold_infra::{
    BackgroundProcessor, BackgroundProcessorConfig, InMemoryWorkStore, ProcessorRegistry, WorkStore,
};

const RECIPIENTS: &[&str] = &[
    "ana@example.org",
    "ops@flaky.example.net",
    "billing@example.com",
    "not-an-address",
    "team@flaky.example.io",
];

const UPLOAD_SIZES: &[u64] = &[48_000, 1_200_000, 0, 5_500_000, 310_000, 64_000_000];

/// Give up waiting for the backlog after this long.
const DEADLINE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leasehold_observability::init();

    let due = Utc::now() - chrono::Duration::seconds(1);

    let outbox = Arc::new(Outbox::new()?);
    let mail_store = InMemoryWorkStore::<ObjectId, MailStatus>::arc();
    for (n, to) in RECIPIENTS.iter().enumerate() {
        let id = ObjectId::new();
        outbox.enqueue(
            id,
            Message {
                to: to.to_string(),
                subject: format!("weekly digest #{n}"),
            },
        );
        mail_store
            .insert(ProcessableObject::new(id, MailStatus::Queued, due))
            .await?;
    }

    let thumbnailer = Arc::new(Thumbnailer::new()?);
    let image_store = InMemoryWorkStore::<ObjectId, ImageStatus>::arc();
    for bytes in UPLOAD_SIZES {
        let id = ObjectId::new();
        thumbnailer.upload(id, *bytes);
        image_store
            .insert(ProcessableObject::new(id, ImageStatus::Uploaded, due))
            .await?;
    }

    let mail_config = BackgroundProcessorConfig::from_env("outbox", "LEASEHOLD_OUTBOX")
        .context("outbox configuration")?;
    let image_config = BackgroundProcessorConfig::from_env("thumbnails", "LEASEHOLD_THUMBNAILS")
        .context("thumbnails configuration")?;

    let mut registry = ProcessorRegistry::new();
    registry.register(BackgroundProcessor::new(outbox, mail_store.clone(), mail_config))?;
    registry.register(BackgroundProcessor::new(
        thumbnailer,
        image_store.clone(),
        image_config,
    ))?;

    registry.start_all().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        _ = tokio::time::sleep(DEADLINE) => tracing::warn!("deadline reached with work outstanding"),
        drained = async {
            while !(settled(&mail_store)? && settled(&image_store)?) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            anyhow::Ok(())
        } => match drained {
            Ok(()) => tracing::info!("backlog drained"),
            Err(e) => tracing::error!(error = %e, "cannot inspect work stores"),
        },
    }

    registry.stop_all().await?;

    println!("{}", serde_json::to_string_pretty(&registry.stats())?);
    Ok(())
}

/// Every object reached a terminal phase.
fn settled<S: ProcessingStatus>(store: &InMemoryWorkStore<ObjectId, S>) -> anyhow::Result<bool> {
    Ok(store
        .snapshot()?
        .iter()
        .all(|o| matches!(o.phase(), ProcessingPhase::Completed | ProcessingPhase::Failed)))
}
