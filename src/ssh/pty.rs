//! PTY output coalescing.
//!
//! Raw terminal output arrives in bursts of tiny chunks. The rate limiter
//! batches them so the bus carries at most `MAX_EVENTS_PER_SECOND`
//! `terminal.data` events per session, with a forced flush once the
//! pending buffer reaches `MAX_COALESCE_BUFFER` bytes.

use base64::Engine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::events::{EventBus, EventKind};

const MAX_EVENTS_PER_SECOND: u32 = 60;
const MAX_COALESCE_BUFFER: usize = 8192;

/// Pump raw PTY bytes into `terminal.data` events until the channel closes.
///
/// Spawned by the session owner alongside the PTY channel task; exits when
/// the output sender is dropped.
pub async fn pump_terminal_output(
    bus: Arc<EventBus>,
    session_id: String,
    mut output: mpsc::Receiver<Vec<u8>>,
) {
    let interval = Duration::from_secs(1) / MAX_EVENTS_PER_SECOND;
    let mut buffer: Vec<u8> = Vec::new();
    let mut last_flush = Instant::now() - interval;

    loop {
        let timeout = if buffer.is_empty() {
            // Nothing pending: wait indefinitely for the next chunk.
            None
        } else {
            Some(interval.saturating_sub(last_flush.elapsed()))
        };

        let chunk = match timeout {
            None => output.recv().await,
            Some(wait) => match tokio::time::timeout(wait, output.recv()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    flush(&bus, &session_id, &mut buffer);
                    last_flush = Instant::now();
                    continue;
                }
            },
        };

        match chunk {
            Some(bytes) => {
                buffer.extend_from_slice(&bytes);
                if buffer.len() >= MAX_COALESCE_BUFFER || last_flush.elapsed() >= interval {
                    flush(&bus, &session_id, &mut buffer);
                    last_flush = Instant::now();
                }
            }
            None => {
                flush(&bus, &session_id, &mut buffer);
                return;
            }
        }
    }
}

fn flush(bus: &EventBus, session_id: &str, buffer: &mut Vec<u8>) {
    if buffer.is_empty() {
        return;
    }
    let data = base64::engine::general_purpose::STANDARD.encode(&buffer);
    buffer.clear();
    bus.publish(EventKind::TerminalData {
        session_id: session_id.to_string(),
        data,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Room;

    #[tokio::test]
    async fn output_is_flushed_and_base64_encoded() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Session("s1".into()), "term");
        let (tx, rx) = mpsc::channel(16);

        let pump = tokio::spawn(pump_terminal_output(bus.clone(), "s1".into(), rx));
        tx.send(b"hello".to_vec()).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        let event = sub.recv().await;
        match event.kind {
            EventKind::TerminalData { data, .. } => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert_eq!(decoded, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bursts_are_coalesced() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_default(Room::Session("s1".into()), "term");
        let (tx, rx) = mpsc::channel(512);

        // A burst of one-byte writes arriving faster than the flush rate.
        for _ in 0..100 {
            tx.send(b"x".to_vec()).await.unwrap();
        }
        drop(tx);
        pump_terminal_output(bus.clone(), "s1".into(), rx).await;

        let mut events = 0;
        let mut total = 0;
        while let Some(ev) = sub.try_recv() {
            if let EventKind::TerminalData { data, .. } = ev.kind {
                total += base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap()
                    .len();
                events += 1;
            }
        }
        assert_eq!(total, 100);
        assert!(events < 100, "expected coalescing, got {events} events");
    }
}
