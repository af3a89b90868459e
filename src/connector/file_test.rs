use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::connector::{ConnectorStats, FileInput, FileOutput, RecordFraming, ResumptionToken, RetryPolicy};
use crate::error::ConnectorError;
use crate::fixtures;
use crate::format::Codec;
use crate::models::{Direction, ErrorPolicy, FileTransport, RetryConfig, RowBatch, Value};

const WAIT: Duration = Duration::from_millis(10);

fn transport(path: &std::path::Path, follow: bool) -> FileTransport {
    FileTransport {
        path: path.to_string_lossy().into_owned(),
        follow,
        max_batch_records: 2,
    }
}

fn input(transport: &FileTransport, watermark: usize) -> FileInput {
    let stats = Arc::new(ConnectorStats::new("test", "source", Direction::Input));
    FileInput::new(transport, RecordFraming::Lines, watermark, RetryPolicy::new(&fixtures::fast_retry(2)), stats)
}

#[tokio::test]
async fn poll_reads_batches_of_lines() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("in.csv");
    tokio::fs::write(&path, "1,a,0.5,true\n2,b,1,false\n3,c,1.5,true").await?;
    let mut input = input(&transport(&path, false), 8);

    let (first, token) = input.poll(WAIT).await?.context("expected a first batch")?;
    assert!(first == b"1,a,0.5,true\n2,b,1,false\n".to_vec(), "unexpected first batch {:?}", String::from_utf8_lossy(&first));
    assert!(token == ResumptionToken::File { position: 25 }, "unexpected token {:?}", token);

    let (second, _) = input.poll(WAIT).await?.context("expected a second batch")?;
    assert!(second == b"3,c,1.5,true".to_vec(), "expected the unterminated last line, got {:?}", String::from_utf8_lossy(&second));
    let eof = input.poll(WAIT).await?;
    assert!(eof.is_none(), "expected no batch at EOF, got {:?}", eof);
    Ok(())
}

#[tokio::test]
async fn follow_mode_waits_for_complete_lines() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("in.csv");
    tokio::fs::write(&path, "1,a,0.5,true\n2,b").await?;
    let mut input = input(&transport(&path, true), 8);

    let (first, _) = input.poll(WAIT).await?.context("expected a first batch")?;
    assert!(first == b"1,a,0.5,true\n".to_vec(), "expected only the complete line, got {:?}", String::from_utf8_lossy(&first));
    let partial = input.poll(WAIT).await?;
    assert!(partial.is_none(), "expected the partial line to be held back, got {:?}", partial);

    tokio::fs::write(&path, "1,a,0.5,true\n2,b,1,false\n").await?;
    let (second, _) = input.poll(WAIT).await?.context("expected the completed line")?;
    assert!(second == b"2,b,1,false\n".to_vec(), "expected the completed line, got {:?}", String::from_utf8_lossy(&second));
    Ok(())
}

#[tokio::test]
async fn ack_and_seek_track_committed_position() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("in.csv");
    tokio::fs::write(&path, "a\nb\nc\nd\ne\n").await?;
    let transport = transport(&path, false);
    let mut input = input(&transport, 1);

    let (_, token) = input.poll(WAIT).await?.context("expected a batch")?;
    let blocked = input.poll(WAIT).await?;
    assert!(blocked.is_none(), "expected the watermark to block polling, got {:?}", blocked);
    input.ack(&token)?;
    input.ack(&token)?;
    assert!(input.checkpoint() == token, "expected checkpoint {:?}, got {:?}", token, input.checkpoint());

    let mut resumed = self::input(&transport, 1);
    resumed.seek(&input.checkpoint()).await?;
    let (batch, _) = resumed.poll(WAIT).await?.context("expected a batch after seek")?;
    assert!(batch == b"c\nd\n".to_vec(), "expected to resume after the acked batch, got {:?}", String::from_utf8_lossy(&batch));
    Ok(())
}

#[tokio::test]
async fn missing_file_is_permanent_after_retries() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let mut input = input(&transport(&dir.path().join("absent.csv"), false), 8);

    let res = input.poll(WAIT).await;

    assert!(matches!(res, Err(ConnectorError::Permanent(_))), "expected a permanent error, got {:?}", res);
    Ok(())
}

#[tokio::test]
async fn output_appends_and_syncs() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("out.json");
    let stats = Arc::new(ConnectorStats::new("test", "sink", Direction::Output));
    let mut output = FileOutput::new(&transport(&path, false), RetryPolicy::new(&fixtures::fast_retry(2)), stats);

    output.send(b"{\"a\":1}\n".to_vec()).await?;
    output.send(b"{\"a\":2}\n".to_vec()).await?;
    output.flush().await?;

    let contents = tokio::fs::read_to_string(&path).await?;
    assert!(contents == "{\"a\":1}\n{\"a\":2}\n", "unexpected file contents {:?}", contents);
    Ok(())
}

#[tokio::test]
async fn quoted_newlines_stay_within_one_batch() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("in.csv");
    let codec = Codec::new(&fixtures::csv(), Arc::new(fixtures::schema()), ErrorPolicy::SkipAndCount);
    let mut multiline = fixtures::row(1, "");
    multiline[1] = Value::String("a\nb".into());
    let batch = RowBatch::new(vec![(fixtures::row(0, "y"), 1), (multiline, 1), (fixtures::row(2, "x"), 1)]);
    tokio::fs::write(&path, codec.encode(&batch)?).await?;
    let stats = Arc::new(ConnectorStats::new("test", "source", Direction::Input));
    let mut input = FileInput::new(&transport(&path, false), RecordFraming::QuotedLines, 8, RetryPolicy::new(&fixtures::fast_retry(2)), stats);

    let (mut rows, mut rejected) = (Vec::new(), 0);
    while let Some((bytes, _)) = input.poll(WAIT).await? {
        let decoded = codec.decode(&bytes)?;
        rejected += decoded.rejected;
        rows.extend(decoded.batch.iter().map(|(row, _)| row.clone()));
    }

    assert!(rejected == 0, "expected no rejected records, got {}", rejected);
    let expected: Vec<_> = batch.iter().map(|(row, _)| row.clone()).collect();
    assert!(rows == expected, "expected every row to survive batching, got {:?}", rows);
    Ok(())
}

#[tokio::test]
async fn follow_mode_holds_back_open_quoted_records() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("in.csv");
    tokio::fs::write(&path, "1,a,0.5,true\n2,\"b\n").await?;
    let stats = Arc::new(ConnectorStats::new("test", "source", Direction::Input));
    let mut input = FileInput::new(&transport(&path, true), RecordFraming::QuotedLines, 8, RetryPolicy::new(&fixtures::fast_retry(2)), stats);

    let (first, _) = input.poll(WAIT).await?.context("expected a first batch")?;
    assert!(first == b"1,a,0.5,true\n".to_vec(), "expected only the closed record, got {:?}", String::from_utf8_lossy(&first));
    let open = input.poll(WAIT).await?;
    assert!(open.is_none(), "expected the open quoted record to be held back, got {:?}", open);

    tokio::fs::write(&path, "1,a,0.5,true\n2,\"b\nc\",1,false\n").await?;
    let (second, _) = input.poll(WAIT).await?.context("expected the closed record")?;
    assert!(second == b"2,\"b\nc\",1,false\n".to_vec(), "expected the whole record, got {:?}", String::from_utf8_lossy(&second));
    Ok(())
}

#[tokio::test]
async fn transient_open_errors_are_retried() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("late.csv");
    let stats = Arc::new(ConnectorStats::new("test", "source", Direction::Input));
    let retry = RetryConfig {
        max_attempts: 5,
        initial_backoff_ms: 50,
        max_backoff_ms: 50,
    };
    let mut input = FileInput::new(&transport(&path, false), RecordFraming::Lines, 8, RetryPolicy::new(&retry), stats.clone());
    let writer = tokio::spawn({
        let path = path.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(&path, "1,a,0.5,true\n").await
        }
    });

    let batch = input.poll(WAIT).await?;
    writer.await??;

    assert!(batch.map(|(bytes, _)| bytes) == Some(b"1,a,0.5,true\n".to_vec()), "expected the batch once the file appeared");
    assert!(stats.retries() >= 1, "expected at least one retry, got {}", stats.retries());
    Ok(())
}

#[tokio::test]
async fn output_truncates_partial_writes_before_appending() -> Result<()> {
    let dir = tempfile::tempdir_in("/tmp").context("error creating tmp dir")?;
    let path = dir.path().join("out.json");
    let stats = Arc::new(ConnectorStats::new("test", "sink", Direction::Output));
    let mut output = FileOutput::new(&transport(&path, false), RetryPolicy::new(&fixtures::fast_retry(2)), stats);

    output.send(b"a\n".to_vec()).await?;
    let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, b"par").await?;
    drop(file);
    output.send(b"b\n".to_vec()).await?;

    let contents = tokio::fs::read_to_string(&path).await?;
    assert!(contents == "a\nb\n", "expected the torn write to be dropped, got {:?}", contents);
    Ok(())
}
