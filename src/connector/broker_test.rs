use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::connector::{Broker, BrokerClients, BrokerInput, BrokerOutput, ConnectorStats, ResumptionToken, RetryPolicy};
use crate::error::ConnectorError;
use crate::fixtures;
use crate::models::{BrokerTransport, Direction};

const WAIT: Duration = Duration::from_millis(50);

fn transport(topic: &str, partitions: Vec<u32>) -> BrokerTransport {
    BrokerTransport {
        address: "memory://local".into(),
        topic: topic.into(),
        partitions,
        group: None,
    }
}

fn stats(name: &str, direction: Direction) -> Arc<ConnectorStats> {
    Arc::new(ConnectorStats::new("test", name, direction))
}

fn input(clients: &BrokerClients, topic: &str, partitions: Vec<u32>, watermark: usize) -> Result<(BrokerInput, Arc<ConnectorStats>)> {
    let stats = stats("source", Direction::Input);
    let client = clients.resolve("memory://local")?;
    let input = BrokerInput::new(
        client,
        &transport(topic, partitions),
        "group".into(),
        watermark,
        RetryPolicy::new(&fixtures::fast_retry(3)),
        stats.clone(),
    );
    Ok((input, stats))
}

fn offsets_of(token: &ResumptionToken) -> Vec<(u32, u64)> {
    match token {
        ResumptionToken::Offsets { offsets } => offsets.iter().map(|(p, o)| (*p, *o)).collect(),
        _ => vec![],
    }
}

#[tokio::test]
async fn poll_returns_records_in_offset_order() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..3u8 {
        broker.append("events", 0, vec![idx]);
    }
    let (mut input, _) = input(&clients, "events", vec![0], 8)?;

    let mut seen = vec![];
    while let Some((payload, token)) = input.poll(WAIT).await? {
        seen.push((payload, offsets_of(&token)));
    }

    let expected = vec![(vec![0u8], vec![(0, 1)]), (vec![1u8], vec![(0, 2)]), (vec![2u8], vec![(0, 3)])];
    assert!(seen == expected, "expected records in offset order {:?}, got {:?}", expected, seen);
    assert!(input.unacked() == 3, "expected 3 unacked batches, got {}", input.unacked());
    Ok(())
}

#[tokio::test]
async fn poll_stops_at_watermark_until_acked() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..5u8 {
        broker.append("events", 0, vec![idx]);
    }
    let (mut input, _) = input(&clients, "events", vec![0], 2)?;

    let (_, first) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a first batch"))?;
    input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a second batch"))?;
    let third = input.poll(WAIT).await?;
    assert!(third.is_none(), "expected no batch beyond the watermark, got {:?}", third);

    input.ack(&first).await?;
    let (payload, _) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch after ack"))?;
    assert!(payload == vec![2u8], "expected the third record after ack, got {:?}", payload);
    Ok(())
}

#[tokio::test]
async fn watermark_applies_per_partition() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..2u8 {
        broker.append("events", 0, vec![idx]);
        broker.append("events", 1, vec![10 + idx]);
    }
    let (mut input, _) = input(&clients, "events", vec![0, 1], 1)?;

    let (first, token) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch from the first partition"))?;
    let (second, _) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch from the second partition"))?;
    assert!(first == vec![0u8] && second == vec![10u8], "expected one batch per partition, got {:?} and {:?}", first, second);
    assert!(input.saturated(), "expected the input to be saturated with every partition at the watermark");
    let third = input.poll(WAIT).await?;
    assert!(third.is_none(), "expected no batch while both partitions are at the watermark, got {:?}", third);

    input.ack(&token).await?;
    assert!(!input.saturated(), "expected the ack to free the first partition");
    let (payload, _) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch after ack"))?;
    assert!(payload == vec![1u8], "expected the next record of the acked partition, got {:?}", payload);
    Ok(())
}

#[tokio::test]
async fn ack_is_idempotent_and_commits_to_broker() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    broker.append("events", 0, b"a".to_vec());
    broker.append("events", 0, b"b".to_vec());
    let (mut input, _) = input(&clients, "events", vec![0], 8)?;

    let (_, first) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch"))?;
    let (_, second) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch"))?;
    input.ack(&second).await?;
    input.ack(&second).await?;
    input.ack(&first).await?;

    let committed = broker.committed("group", "events", 0).await?;
    assert!(committed == Some(2), "expected committed offset 2, got {:?}", committed);
    assert!(input.unacked() == 0, "expected no unacked batches, got {}", input.unacked());
    assert!(offsets_of(&input.checkpoint()) == vec![(0, 2)], "expected checkpoint at offset 2, got {:?}", input.checkpoint());
    Ok(())
}

#[tokio::test]
async fn partitions_are_polled_round_robin() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..3u8 {
        broker.append("events", 0, vec![idx]);
        broker.append("events", 1, vec![10 + idx]);
    }
    let (mut input, _) = input(&clients, "events", vec![0, 1], 16)?;

    let mut partitions = vec![];
    for _ in 0..6 {
        let (_, token) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch"))?;
        partitions.extend(offsets_of(&token).into_iter().map(|(partition, _)| partition));
    }

    assert!(partitions == vec![0, 1, 0, 1, 0, 1], "expected alternating partitions, got {:?}", partitions);
    Ok(())
}

#[tokio::test]
async fn seek_resumes_from_token() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..4u8 {
        broker.append("events", 0, vec![idx]);
    }
    let (mut input, _) = input(&clients, "events", vec![0], 8)?;

    input.seek(&ResumptionToken::Offsets {
        offsets: [(0, 3)].into_iter().collect(),
    })?;
    let (payload, _) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch"))?;

    assert!(payload == vec![3u8], "expected the record at offset 3, got {:?}", payload);
    Ok(())
}

#[tokio::test]
async fn new_reader_resumes_from_committed_offset() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    for idx in 0..3u8 {
        broker.append("events", 0, vec![idx]);
    }
    broker.commit("group", "events", 0, 2).await?;
    let (mut input, _) = input(&clients, "events", vec![0], 8)?;

    let (payload, _) = input.poll(WAIT).await?.ok_or_else(|| anyhow::anyhow!("expected a batch"))?;

    assert!(payload == vec![2u8], "expected to resume at the committed offset, got {:?}", payload);
    Ok(())
}

#[tokio::test]
async fn file_token_is_rejected() -> Result<()> {
    let clients = BrokerClients::default();
    let (mut input, _) = input(&clients, "events", vec![0], 8)?;

    let res = input.ack(&ResumptionToken::File { position: 10 }).await;

    assert!(matches!(res, Err(ConnectorError::Permanent(_))), "expected a permanent error, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn unavailable_broker_becomes_permanent_after_retries() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    broker.set_available(false);
    let (mut input, stats) = input(&clients, "events", vec![0], 8)?;

    let res = input.poll(WAIT).await;

    assert!(matches!(res, Err(ConnectorError::Permanent(_))), "expected a permanent error, got {:?}", res);
    assert!(stats.retries() == 2, "expected 2 retries for 3 attempts, got {}", stats.retries());
    Ok(())
}

#[tokio::test]
async fn produce_retries_transient_faults_in_order() -> Result<()> {
    let clients = BrokerClients::default();
    let broker = clients.memory("memory://local");
    let stats = stats("sink", Direction::Output);
    let mut output = BrokerOutput::new(
        clients.resolve("memory://local")?,
        &transport("out", vec![0]),
        RetryPolicy::new(&fixtures::fast_retry(3)),
        stats.clone(),
    );

    output.send(b"first".to_vec()).await?;
    broker.fail_produces(2);
    output.send(b"second".to_vec()).await?;
    output.flush().await?;

    let records = broker.records("out", 0);
    assert!(records == vec![b"first".to_vec(), b"second".to_vec()], "expected records in send order, got {:?}", records);
    assert!(stats.retries() == 2, "expected 2 retries, got {}", stats.retries());
    Ok(())
}

#[tokio::test]
async fn unknown_address_is_a_config_error() {
    let clients = BrokerClients::default();
    let res = clients.resolve("kafka://broker-0:9092");
    assert!(res.is_err(), "expected an unresolvable address to be rejected");
}
