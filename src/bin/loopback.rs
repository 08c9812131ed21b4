// ABOUTME: ristnet loopback demo binary
// ABOUTME: Runs a receiver and a sender over the in-process transport and reports traffic

use clap::Parser;
use ristnet::cli::EndpointArgs;
use ristnet::tools::build_rist_url;
use ristnet::transport::LoopbackBackend;
use ristnet::{RistReceiver, RistSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "ristnet-loopback")]
#[command(author, version, about = "RIST receiver and sender over the loopback transport", long_about = None)]
struct Args {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// IP address the receiver listens on
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port the receiver listens on
    #[arg(short, long, default_value = "8000")]
    port: String,

    /// Number of packets to send (0 sends until Ctrl+C)
    #[arg(short, long, default_value = "100")]
    count: u64,

    /// Payload size in bytes
    #[arg(short, long, default_value = "1316")]
    size: usize,

    /// Flow id of the stream
    #[arg(long, default_value = "1")]
    flow_id: u32,

    /// Interval between packets in milliseconds
    #[arg(long, default_value = "10")]
    interval_ms: u64,
}

/// What the receiver remembers about an admitted peer
struct PeerInfo {
    addr: String,
    since: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    args.endpoint.init_tracing();

    let settings = args.endpoint.build_settings()?;
    args.endpoint.log_startup_info(&settings);

    let listen_url = build_rist_url(&args.ip, &args.port, true)?;
    let connect_url = build_rist_url(&args.ip, &args.port, false)?;

    let backend = Arc::new(LoopbackBackend::new());

    let mut receiver: RistReceiver<PeerInfo> = RistReceiver::new(backend.clone());
    receiver
        .on_validate_connection(|ip, port| {
            tracing::info!("Accepting connection from {}:{}", ip, port);
            Some(Arc::new(PeerInfo {
                addr: format!("{}:{}", ip, port),
                since: Instant::now(),
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            }))
        })
        .on_data(|payload, info, _peer, _flow_id| {
            info.packets.fetch_add(1, Ordering::Relaxed);
            info.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
            0
        })
        .on_oob_data(|payload, info, _peer| {
            tracing::info!("OOB from {}: {}", info.addr, String::from_utf8_lossy(payload));
        });
    receiver.init(&[listen_url.as_str()], &settings)?;
    let receiver = Arc::new(receiver);

    let mut sender: RistSender<String> = RistSender::new(backend.clone());
    sender
        .on_validate_connection(|ip, port| Some(Arc::new(format!("{}:{}", ip, port))))
        .on_oob_data(|payload, addr, _peer| {
            tracing::info!("OOB from {}: {}", addr, String::from_utf8_lossy(payload));
        });
    sender.init(&[(connect_url.as_str(), 5)], &settings)?;

    let version = sender.version();
    tracing::info!(
        "Wrapper v{}, transport API {}.{}",
        version.wrapper,
        version.transport_major,
        version.transport_minor
    );

    // Greet every admitted receiver peer over the out-of-band channel
    let handles = receiver.active_clients(|peers| peers.keys().copied().collect::<Vec<_>>());
    for handle in handles {
        receiver.send_oob_data(handle, b"hello from receiver")?;
    }

    // Spawn a task to periodically report connected peers
    let report_receiver = Arc::clone(&receiver);
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let count = report_receiver.client_count();
            if count > 0 {
                tracing::info!("Connected peers: {}", count);
                report_receiver.active_clients(|peers| {
                    for (handle, info) in peers {
                        tracing::info!(
                            "  - {} ({}): {} packets, {} bytes, up {:?}",
                            info.addr,
                            handle,
                            info.packets.load(Ordering::Relaxed),
                            info.bytes.load(Ordering::Relaxed),
                            info.since.elapsed()
                        );
                    }
                });
            }
        }
    });

    tracing::info!("Press Ctrl+C to stop");

    let payload = vec![0x47u8; args.size];
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0u64;
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = ticker.tick() => {
                if args.count > 0 && sent >= args.count {
                    break Ok(());
                }
                if let Err(e) = sender.send_data(&payload, args.flow_id) {
                    tracing::error!("Send failed: {}", e);
                    break Err(e);
                }
                sent += 1;
            }
        }
    };

    // Let the receiver worker drain before the final report
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    report_task.abort();

    let received: u64 = receiver.active_clients(|peers| {
        peers
            .values()
            .map(|info| info.packets.load(Ordering::Relaxed))
            .sum()
    });
    tracing::info!("Sent {} packets, receiver counted {}", sent, received);

    if sender.is_initialized() {
        sender.destroy()?;
    }
    receiver.destroy()?;
    result?;
    Ok(())
}
