use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::connector::BrokerClients;
use crate::database::Database;
use crate::error::{AppError, ConfigError};
use crate::fixtures;
use crate::format::Codec;
use crate::models::{ErrorPolicy, FormatConfig, Value};
use crate::pipeline::PipelineState;
use crate::registry::Registry;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn registry() -> Result<(Registry, Database, Arc<Config>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let registry = Registry::new(config.clone(), &db, BrokerClients::default()).await?;
    Ok((registry, db, config, tmpdir))
}

/// Wait until the JSON output file holds at least `count` rows, returning their ids.
async fn wait_output_ids(path: &std::path::Path, count: usize) -> Result<Vec<i64>> {
    let codec = Codec::new(&FormatConfig::Json, Arc::new(fixtures::schema()), ErrorPolicy::SkipAndCount);
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let bytes = tokio::fs::read(path).await.unwrap_or_default();
        let decoded = codec.decode(&bytes)?;
        let ids: Vec<i64> = decoded
            .batch
            .iter()
            .filter_map(|(row, _)| match row.first() {
                Some(Value::Int(id)) => Some(*id),
                _ => None,
            })
            .collect();
        if ids.len() >= count {
            return Ok(ids);
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "timeout waiting for {} output rows, found {:?}", count, ids);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn app_error(err: &anyhow::Error) -> Option<&AppError> {
    err.downcast_ref::<AppError>()
}

#[tokio::test]
async fn lifecycle_commands_drive_state_transitions() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let id = registry.create(fixtures::broker_pipeline("orders", "memory://lifecycle")).await?;
    assert!(registry.get(&id)?.state == PipelineState::Provisioning, "expected a new pipeline to be idle in provisioning");

    let view = registry.start(&id).await?;
    assert!(view.state == PipelineState::Running, "expected running after start, got {:?}", view.state);
    let view = registry.start(&id).await?;
    assert!(view.state == PipelineState::Running, "expected start on a running pipeline to be a no-op, got {:?}", view.state);

    let view = registry.pause(&id).await?;
    assert!(view.state == PipelineState::Paused, "expected paused, got {:?}", view.state);
    let view = registry.start(&id).await?;
    assert!(view.state == PipelineState::Running, "expected start to resume a paused pipeline, got {:?}", view.state);

    let view = registry.shutdown(&id).await?;
    assert!(view.state == PipelineState::Terminated, "expected terminated, got {:?}", view.state);
    assert!(view.uptime_seconds == 0.0, "expected no uptime once terminated, got {}", view.uptime_seconds);

    let view = registry.start(&id).await?;
    assert!(view.state == PipelineState::Running, "expected a terminated pipeline to start again, got {:?}", view.state);
    registry.shutdown(&id).await?;
    registry.delete(&id).await?;
    let res = registry.get(&id);
    assert!(matches!(res.as_ref().map_err(app_error), Err(Some(AppError::ResourceNotFound))), "expected deleted pipeline to be gone");
    Ok(())
}

#[tokio::test]
async fn incompatible_config_is_rejected_on_create() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let mut config = fixtures::broker_pipeline("audit", "memory://create");
    config.outputs = vec![fixtures::file_connector("sink", "/tmp/audit.bin", FormatConfig::Binary)];

    let err = registry.create(config).await.err().context("expected create to fail")?;

    let config_err = err.downcast_ref::<ConfigError>();
    assert!(
        config_err.map(|err| err.0.contains("incompatible")).unwrap_or(false),
        "expected a config error for the incompatible format, got {:?}",
        err
    );
    assert!(registry.list().is_empty(), "expected no pipeline to be registered");
    Ok(())
}

#[tokio::test]
async fn duplicate_names_conflict() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    registry.create(fixtures::broker_pipeline("orders", "memory://dup")).await?;
    let err = registry
        .create(fixtures::broker_pipeline("orders", "memory://dup"))
        .await
        .err()
        .context("expected duplicate create to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Conflict(_))), "expected a conflict, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn running_pipelines_can_not_be_updated_or_deleted() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let config = fixtures::broker_pipeline("orders", "memory://guard");
    let id = registry.create(config.clone()).await?;
    registry.start(&id).await?;

    let err = registry.delete(&id).await.err().context("expected delete to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Conflict(_))), "expected a conflict on delete, got {:?}", err);
    let err = registry.update(&id, config.clone()).await.err().context("expected update to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Conflict(_))), "expected a conflict on update, got {:?}", err);

    registry.shutdown(&id).await?;
    let mut updated = config;
    updated.inputs[0].max_buffered_batches = 2;
    let view = registry.update(&id, updated).await?;
    assert!(view.config.inputs[0].max_buffered_batches == 2, "expected the update to apply");
    Ok(())
}

#[tokio::test]
async fn unresolvable_broker_fails_provisioning() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let id = registry.create(fixtures::broker_pipeline("orders", "kafka://broker-0:9092")).await?;

    let view = registry.start(&id).await?;

    assert!(matches!(&view.state, PipelineState::Failed { reason } if reason.contains("kafka://broker-0:9092")), "expected provisioning to fail, got {:?}", view.state);
    let err = registry.pause(&id).await.err().context("expected pause to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Conflict(_))), "expected a conflict, got {:?}", err);
    registry.delete(&id).await?;
    Ok(())
}

#[tokio::test]
async fn restart_recovers_a_failed_pipeline() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let broker = registry.brokers().memory("memory://flaky");
    broker.set_available(false);
    let id = registry.create(fixtures::broker_pipeline("orders", "memory://flaky")).await?;
    registry.start(&id).await?;
    let mut rx = registry.entry(&id)?.subscribe();
    fixtures::wait_for_state(&mut rx, TIMEOUT, |state| matches!(state, PipelineState::Failed { .. })).await?;

    let err = registry.start(&id).await.err().context("expected start on a failed pipeline to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Conflict(_))), "expected a conflict, got {:?}", err);

    broker.set_available(true);
    let view = registry.restart(&id).await?;
    assert!(view.state == PipelineState::Running, "expected running after restart, got {:?}", view.state);
    assert!(view.last_error.is_some(), "expected the last error to be kept after restart");
    Ok(())
}

#[tokio::test]
async fn concurrent_commands_are_serialized() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let broker = registry.brokers().memory("memory://busy");
    broker.set_produce_delay(Duration::from_millis(300));
    let id = registry.create(fixtures::broker_pipeline("orders", "memory://busy")).await?;
    registry.start(&id).await?;
    broker.append("orders-in", 0, b"1,a,0.5,true\n".to_vec());
    let entry = registry.entry(&id)?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while entry.view().connectors.iter().all(|c| c.batches_processed == 0) {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "timeout waiting for the batch to be picked up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (first, second) = tokio::join!(registry.shutdown(&id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.pause(&id).await
    });

    let view = first?;
    assert!(view.state == PipelineState::Terminated, "expected the first command to complete, got {:?}", view.state);
    let err = second.err().context("expected the concurrent command to fail")?;
    assert!(matches!(app_error(&err), Some(AppError::Busy)), "expected busy, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn pipelines_are_recovered_idle() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let id = {
        let registry = Registry::new(config.clone(), &db, BrokerClients::default()).await?;
        let id = registry.create(fixtures::broker_pipeline("orders", "memory://recover")).await?;
        registry.start(&id).await?;
        registry.shutdown_all().await;
        id
    };

    let registry = Registry::new(config, &db, BrokerClients::default()).await?;
    let view = registry.get(&id)?;

    assert!(view.name == "orders", "expected the recovered pipeline, got {}", view.name);
    assert!(view.state == PipelineState::Provisioning, "expected the recovered pipeline to be idle, got {:?}", view.state);
    Ok(())
}

#[tokio::test]
async fn update_resets_checkpoints_of_changed_inputs() -> Result<()> {
    let (registry, _db, _config, tmpdir) = registry().await?;
    let (first, second, out) = (tmpdir.path().join("a.csv"), tmpdir.path().join("b.csv"), tmpdir.path().join("out.ndjson"));
    tokio::fs::write(&first, "1,a,0.5,true\n2,b,1,false\n").await?;
    tokio::fs::write(&second, "3,c,1.5,true\n4,d,2,false\n5,e,2.5,true\n").await?;
    let path = |path: &std::path::Path| path.to_string_lossy().into_owned();
    let mut config = fixtures::pipeline(
        "reset",
        vec![fixtures::file_connector("source", &path(&first), fixtures::csv())],
        vec![fixtures::file_connector("sink", &path(&out), FormatConfig::Json)],
    );
    let id = registry.create(config.clone()).await?;
    registry.start(&id).await?;
    wait_output_ids(&out, 2).await?;
    registry.shutdown(&id).await?;

    config.inputs[0] = fixtures::file_connector("source", &path(&second), fixtures::csv());
    registry.update(&id, config).await?;
    registry.start(&id).await?;
    let ids = wait_output_ids(&out, 5).await?;

    assert!(ids == vec![1, 2, 3, 4, 5], "expected the new input to be read from its start, got {:?}", ids);
    registry.shutdown(&id).await?;
    Ok(())
}

#[tokio::test]
async fn commands_on_a_deleted_entry_are_not_found() -> Result<()> {
    let (registry, _db, _config, _tmpdir) = registry().await?;
    let id = registry.create(fixtures::broker_pipeline("orders", "memory://deleted")).await?;
    let entry = registry.entry(&id)?;

    registry.delete(&id).await?;
    let res = registry.lock_slot(&entry).map(|_| ());

    assert!(
        matches!(res.as_ref().map_err(app_error), Err(Some(AppError::ResourceNotFound))),
        "expected a stale entry to be rejected, got {:?}",
        res
    );
    Ok(())
}
