//! Rendezvous Client Example
//!
//! Signs in to a rendezvous server, prints the roster and calls the first
//! peer listed. Incoming offers are answered automatically.
//!
//! Usage:
//!   cargo run --example rendezvous_client -- <server_url> <name> [config.json]
//!
//! Examples:
//!   cargo run --example rendezvous_client -- http://localhost:8888 alice
//!   RUST_LOG=debug cargo run --example rendezvous_client -- http://localhost:8888 bob client.json

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rendezvous_webrtc::{
    ClientConfig, DataChannelBridge, FrameKind, NegotiationError, NegotiatorEvent,
    RendezvousClient, SessionNegotiator, SignalingEvent, WebRtcEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <server_url> <name> [config.json]", args[0]);
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  {} http://localhost:8888 alice", args[0]);
        eprintln!("  {} http://localhost:8888 bob client.json", args[0]);
        std::process::exit(1);
    }
    let server_url = &args[1];
    let name = &args[2];
    let config = match args.get(3) {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };

    println!("========================================");
    println!("  Rendezvous WebRTC Client");
    println!("========================================");
    println!();
    println!("Server:  {}", server_url);
    println!("Name:    {}", name);
    println!();

    let engine = Arc::new(WebRtcEngine::new()?);
    let client = RendezvousClient::new(config.rendezvous.clone());
    let negotiator = Arc::new(SessionNegotiator::new(
        engine,
        Arc::new(client.clone()),
        config.negotiator.clone(),
    ));
    client.add_observer(&negotiator);

    let bridge = Arc::new(DataChannelBridge::new(negotiator.clone(), Arc::new(client.clone())));
    bridge.on_frame(FrameKind::Message, |frame| {
        println!("[message] {}", frame.data().map(|d| d.to_string()).unwrap_or_default());
    });
    bridge.on_unhandled(|frame| {
        println!("[frame] {:?}", frame.kind);
    });
    let shutdown = CancellationToken::new();
    let pump = {
        let events = negotiator.subscribe();
        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { bridge.pump(events, shutdown).await })
    };

    let mut signaling_events = client.subscribe();
    let mut negotiator_events = negotiator.subscribe();

    client.connect(server_url, name).await?;
    println!("[OK] Signed in as {} (id {})", name, client.self_id());

    let peers = client.peers();
    if peers.is_empty() {
        println!("No other peers yet, waiting for a call...");
    }
    for peer in &peers {
        println!("  peer {:>4}  {}", peer.id, peer.name);
    }
    if let Some(peer) = peers.first() {
        println!("Calling {}...", peer.name);
        negotiator.connect_to_peer(peer).await?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    println!("Press Ctrl+C to stop.");
    println!();

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;

        while let Ok(event) = signaling_events.try_recv() {
            match event {
                SignalingEvent::PeerConnected { id, name } => println!("+ peer {} ({})", id, name),
                SignalingEvent::PeerDisconnected(id) => println!("- peer {}", id),
                SignalingEvent::Disconnected => {
                    println!("Rendezvous session ended");
                    running.store(false, Ordering::SeqCst);
                }
                _ => {}
            }
        }

        while let Ok(event) = negotiator_events.try_recv() {
            match event {
                NegotiatorEvent::PeerConnectionCreated { peer_id } => {
                    println!("[OK] Peer connection with {}", peer_id);
                }
                NegotiatorEvent::RemoteTrackAdded(track) => {
                    println!("Remote {} track {}", track.kind.as_str(), track.id);
                }
                NegotiatorEvent::DataChannelOpened { label } => {
                    println!("Data channel '{}' open", label);
                    if let Err(e) = bridge.send(&FrameKind::Message, "hello").await {
                        println!("[WARN] Failed to greet peer: {}", e);
                    }
                }
                NegotiatorEvent::PeerConnectionClosed { peer_id } => {
                    println!("Peer connection with {} closed", peer_id);
                }
                _ => {}
            }
        }
    }

    println!();
    println!("Disconnecting...");
    match negotiator.disconnect_from_peer().await {
        Ok(()) | Err(NegotiationError::NoActivePeer) => {}
        Err(e) => println!("[WARN] {}", e),
    }
    client.sign_out().await?;
    shutdown.cancel();
    let _ = pump.await;
    println!("[OK] Disconnected");

    Ok(())
}
