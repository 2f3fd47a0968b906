use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;

use inscriber_infra::jobs::{InscriptionProcessor, InscriptionWorker};
use inscriber_infra::ledger::{
    AccountSetup, HttpLedgerClient, LedgerClient, UnconfiguredLedger,
};
use inscriber_infra::queue::RedisQueue;
use inscriber_infra::records::PostgresParlayRepository;

use crate::config::{LedgerSettings, WorkerConfig};

/// Pick the ledger client for these settings.
///
/// Missing credentials or a client that cannot be built do not stop the
/// process: every submission fails instead, and records end up `failed`
/// with the reason once their retries run out.
pub fn build_ledger(settings: &LedgerSettings) -> Arc<dyn LedgerClient> {
    let Some(http) = settings.http_config() else {
        let missing = settings.missing().join(", ");
        tracing::error!(%missing, "ledger credentials not configured; inscriptions will fail");
        return Arc::new(UnconfiguredLedger::new(missing));
    };

    match HttpLedgerClient::new(http) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            tracing::error!(error = %err, "failed to build ledger client; inscriptions will fail");
            Arc::new(UnconfiguredLedger::new(format!("usable ledger client ({err})")))
        }
    }
}

/// One-time account setup. Failures are logged; jobs still run.
pub async fn initialize_ledger(ledger: &dyn LedgerClient) {
    match ledger.initialize().await {
        Ok(AccountSetup::Created) => tracing::info!("ledger account created"),
        Ok(AccountSetup::AlreadyInitialized) => tracing::info!("ledger account already initialized"),
        Err(err) => tracing::error!(error = %err, "ledger account setup failed"),
    }
}

/// Connect everything, run the worker until SIGINT/SIGTERM, then drain.
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(config.database_url.expose_secret())
        .await
        .context("failed to connect to Postgres")?;

    let queue = RedisQueue::connect(config.redis_url.expose_secret())
        .await
        .context("failed to connect to Redis")?;

    let ledger = build_ledger(&config.ledger);
    initialize_ledger(ledger.as_ref()).await;

    let processor = InscriptionProcessor::new(
        PostgresParlayRepository::new(pool.clone()),
        ledger,
        queue,
        config.processor_config(),
    );
    let handle = InscriptionWorker::new(processor, config.worker_config()).spawn();

    shutdown_signal().await;
    tracing::info!("shutdown requested; waiting for the current job to finish");

    let stats = handle.shutdown().await;
    pool.close().await;
    tracing::info!(?stats, "inscriber worker exited");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use inscriber_infra::ledger::{InscriptionPayload, LedgerError, LedgerTag};
    use secrecy::SecretString;

    fn settings(rpc_url: Option<&str>, key: Option<&str>) -> LedgerSettings {
        LedgerSettings {
            rpc_url: rpc_url.map(str::to_string),
            signing_key: key.map(|k| SecretString::from(k.to_string())),
            timeout: Duration::from_secs(1),
            tag: LedgerTag::default(),
        }
    }

    fn payload() -> InscriptionPayload {
        InscriptionPayload {
            record_id: "p-1".into(),
            account_reference: "acct".into(),
            content_hash: "abc".into(),
            created_at: "2024-01-01T00:00:00.000Z".into(),
            tag: LedgerTag::default(),
        }
    }

    #[tokio::test]
    async fn missing_credentials_fall_back_to_failing_ledger() {
        let ledger = build_ledger(&settings(Some("https://ledger.example"), None));

        let err = ledger.submit(&payload()).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::NotConfigured("missing LEDGER_SIGNING_KEY".into())
        );
        assert!(err.to_string().contains("LEDGER_SIGNING_KEY"));
    }

    #[tokio::test]
    async fn initialize_failure_is_not_fatal() {
        let ledger = build_ledger(&settings(None, None));
        initialize_ledger(ledger.as_ref()).await;
    }
}
