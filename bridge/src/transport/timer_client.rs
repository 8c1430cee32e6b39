//! Typed wrapper around [`BleClient`] for the AMG shot timer: attaches
//! [`crate::parsers::timer::parse`] to the raw notification stream and
//! forwards decoded [`TimerFrame`]s on a bounded channel.

use bridge_types::TimerFrame;
use tokio::sync::{mpsc, watch};

use crate::transport::ble::BleClient;

/// Drives one BLE session and the frame decoder concurrently until
/// `shutdown` fires. Never returns early on a malformed frame — the parser
/// itself falls back to `TimerFrame::Unknown` rather than erroring.
pub async fn run(
    client: BleClient,
    parsed_tx: mpsc::Sender<TimerFrame>,
    shutdown: watch::Receiver<bool>,
) {
    let (raw_tx, raw_rx) = mpsc::channel(256);
    tokio::join!(
        client.run(raw_tx, shutdown),
        decode_loop(raw_rx, parsed_tx)
    );
}

async fn decode_loop(mut raw_rx: mpsc::Receiver<Vec<u8>>, parsed_tx: mpsc::Sender<TimerFrame>) {
    while let Some(raw) = raw_rx.recv().await {
        let frame = crate::parsers::timer::parse(&raw);
        if parsed_tx.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decode_loop_forwards_parsed_frames_in_order() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (parsed_tx, mut parsed_rx) = mpsc::channel(8);

        let mut start = vec![0u8; 14];
        start[0] = 0x01;
        start[1] = 0x05;
        start[13] = 7;

        raw_tx.send(start).await.unwrap();
        drop(raw_tx);

        decode_loop(raw_rx, parsed_tx).await;

        match parsed_rx.recv().await.unwrap() {
            TimerFrame::Start { string_number } => assert_eq!(string_number, 7),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
