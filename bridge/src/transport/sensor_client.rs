//! Typed wrapper around [`BleClient`] for a BT50-style accelerometer:
//! attaches [`crate::parsers::sensor::parse`] and forwards decoded
//! [`SensorFrame`]s. A malformed frame (short buffer, wrong magic) is
//! counted by the caller as a dropped frame rather than surfaced here —
//! the parser has no side channel for metrics, so `None` is the signal.

use bridge_types::SensorFrame;
use tokio::sync::{mpsc, watch};

use crate::transport::ble::BleClient;

pub async fn run(
    client: BleClient,
    parsed_tx: mpsc::Sender<Option<SensorFrame>>,
    shutdown: watch::Receiver<bool>,
) {
    let (raw_tx, raw_rx) = mpsc::channel(256);
    tokio::join!(
        client.run(raw_tx, shutdown),
        decode_loop(raw_rx, parsed_tx)
    );
}

async fn decode_loop(mut raw_rx: mpsc::Receiver<Vec<u8>>, parsed_tx: mpsc::Sender<Option<SensorFrame>>) {
    while let Some(raw) = raw_rx.recv().await {
        let frame = crate::parsers::sensor::parse(&raw);
        if parsed_tx.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decode_loop_forwards_none_for_malformed_frame() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (parsed_tx, mut parsed_rx) = mpsc::channel(8);

        raw_tx.send(vec![0xFF, 0xFF, 0x01]).await.unwrap();
        drop(raw_tx);

        decode_loop(raw_rx, parsed_tx).await;
        assert_eq!(parsed_rx.recv().await.unwrap(), None);
    }
}
