//! JSON-lines frame source.
//!
//! Each non-empty line is one `FrameObservation` produced by the external
//! detector/embedder, e.g.
//!
//! ```text
//! {"timestamp":"2026-01-05T09:00:00Z","detections":[{"embedding":[...],
//!   "confidence":0.93,"bbox":{"x":10,"y":20,"width":96,"height":96}}]}
//! ```
//!
//! (one line in the actual stream).

use crate::config::Backpressure;
use crate::engine::{EngineError, EngineHandle};
use presence_core::FrameObservation;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Parse one line. `None` for blank lines.
pub fn parse_line(line: &str) -> Option<Result<FrameObservation, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Read frames from `path` (or stdin) until EOF, feeding the engine.
///
/// Returns the number of frames handed to the engine.
pub async fn run(
    path: Option<&Path>,
    engine: EngineHandle,
    backpressure: Backpressure,
) -> std::io::Result<u64> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "reading frames from file");
            let file = tokio::fs::File::open(path).await?;
            feed(BufReader::new(file), engine, backpressure).await
        }
        None => {
            tracing::info!("reading frames from stdin");
            feed(BufReader::new(tokio::io::stdin()), engine, backpressure).await
        }
    }
}

async fn feed<R: AsyncBufRead + Unpin>(
    reader: R,
    engine: EngineHandle,
    backpressure: Backpressure,
) -> std::io::Result<u64> {
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut submitted = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let frame = match parse_line(&line) {
            None => continue,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed frame");
                continue;
            }
        };

        let result = match backpressure {
            Backpressure::DropNewest => engine.try_submit(frame),
            Backpressure::Block => engine.submit(frame).await,
        };
        match result {
            Ok(()) => submitted += 1,
            Err(EngineError::QueueFull) => {}
            Err(e) => {
                tracing::error!(error = %e, "engine unavailable; stopping source");
                break;
            }
        }
    }
    Ok(submitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use presence_core::{MemoryStore, Pipeline, PipelineConfig};

    #[test]
    fn test_parse_line() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("{not json").unwrap().is_err());

        let frame = parse_line(
            r#"{"timestamp":"2026-01-05T09:00:00Z","detections":[{"embedding":[0.6,0.8]}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(frame.detections[0].embedding, vec![0.6, 0.8]);
        assert!(frame.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_feed_skips_bad_lines() {
        let pipeline = Pipeline::new(MemoryStore::new(), &PipelineConfig::default()).unwrap();
        let engine = spawn_engine(pipeline, 4).unwrap();
        let input = concat!(
            r#"{"detections":[{"embedding":[1.0,0.0]}]}"#,
            "\n\ngarbage\n",
            r#"{"detections":[{"embedding":[0.0,1.0]}]}"#,
            "\n",
        );

        let submitted = feed(input.as_bytes(), engine.clone(), Backpressure::Block)
            .await
            .unwrap();
        assert_eq!(submitted, 2);

        let status = engine.status().await.unwrap();
        assert_eq!(status.stats.identities, 2);
    }
}
