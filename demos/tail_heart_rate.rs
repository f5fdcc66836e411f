use std::error::Error;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use vitals_stream::reconnect::{spawn_reconnector, ReconnectPolicy};
use vitals_stream::{ConnectionState, MetricKind, StreamClient, StreamConfig};

const SAMPLES_TO_PRINT: usize = 20;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("VITALS_STREAM_TOKEN")
        .unwrap_or_else(|_| "REPLACE_WITH_STREAM_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Arc::new(StreamClient::new(StreamConfig::new(SecretString::new(
            token,
        ))));

        let (bpm_tx, mut bpm_rx) = mpsc::unbounded_channel();
        client.on_metric(MetricKind::HeartRate, move |sample| {
            let _ = bpm_tx.send(sample);
        });
        client.on_lifecycle_change(|change| {
            println!("state {} -> {}", change.previous, change.current);
        });

        let reconnector = spawn_reconnector(&client, ReconnectPolicy::default());
        let session = client.connect()?;
        println!("connecting session={session}");

        let mut states = client.watch_state();
        let mut printed = 0;
        while printed < SAMPLES_TO_PRINT {
            tokio::select! {
                sample = bpm_rx.recv() => {
                    let Some(sample) = sample else { break };
                    println!("heart_rate={} seq={:?}", sample.value, sample.seq);
                    printed += 1;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    if let ConnectionState::Errored(reason) = &state {
                        if !reason.is_transient() {
                            println!("giving up: {reason}");
                            break;
                        }
                    }
                }
            }
        }

        reconnector.abort();
        client.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })
}
