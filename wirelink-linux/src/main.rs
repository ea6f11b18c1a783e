// Wirelink Linux: UDP transport, discovery, file transfer, calls and broadcast over a wired/tethered link.

mod audio;
mod call;
mod config;
mod console;
mod discovery;
mod events;
mod files;
mod iface;
mod stream;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;
use wirelink_core::PeerSession;

use crate::audio::{AudioPipeline, ProcessBackend};
use crate::call::CallController;
use crate::console::Console;
use crate::events::EventReceiver;
use crate::files::{FileReceiveTask, FileSender};
use crate::stream::{Broadcaster, StreamReceiver};
use crate::transport::Transport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("wirelink-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let bind = iface::bind_address(cfg.bind)?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (events, event_rx) = events::channel();
        let transport = Transport::bind(bind, cfg.port, events.clone())
            .with_context(|| format!("binding {}:{}", bind, cfg.port))?;
        let session = Arc::new(Mutex::new(PeerSession::new()));

        // Subscribe everything before the receive loop starts so no early datagram is lost.
        let link_inbox = discovery::link_inbox(&transport).await;
        let ack_inbox = files::sender_inbox(&transport).await;
        let file_inbox = files::receiver_inbox(&transport).await;
        let call_inbox = call::call_inbox(&transport).await;
        let stream_inbox = stream::receiver_inbox(&transport).await;
        let stream_ack_inbox = stream::broadcaster_inbox(&transport).await;
        let mut unclassified = transport.subscribe_unclassified().await;

        let files = FileSender::new(transport.clone(), cfg.transfer.clone(), events.clone());
        let audio = Arc::new(AudioPipeline::new(cfg.audio.clone(), Arc::new(ProcessBackend)));
        let calls = CallController::new(transport.clone(), session.clone(), audio, events.clone());
        let broadcaster = Broadcaster::new(transport.clone());

        tokio::spawn(transport.clone().run());
        tokio::spawn(discovery::run_link(
            transport.clone(),
            session.clone(),
            events.clone(),
            link_inbox,
        ));
        tokio::spawn(files.clone().run_acks(ack_inbox));
        tokio::spawn(
            FileReceiveTask::new(transport.clone(), cfg.download_dir.clone(), events.clone())
                .run(file_inbox),
        );
        tokio::spawn(calls.clone().run(call_inbox));
        tokio::spawn(
            StreamReceiver::new(transport.clone(), cfg.download_dir.clone(), events.clone())
                .run(stream_inbox),
        );
        tokio::spawn(broadcaster.clone().run_acks(stream_ack_inbox));
        tokio::spawn(async move {
            while let Some(msg) = unclassified.recv().await {
                tracing::debug!(from = %msg.peer, kind = %msg.kind, bytes = msg.payload.len(), "unclassified message");
            }
        });
        tokio::spawn(print_events(event_rx));
        if cfg.beacon_interval_secs > 0 {
            tokio::spawn(discovery::beacon_loop(
                transport.clone(),
                session.clone(),
                Duration::from_secs(cfg.beacon_interval_secs),
            ));
        }

        tracing::info!(
            local = %transport.local_addr(),
            download_dir = %cfg.download_dir.display(),
            "wirelink {} ready",
            VERSION
        );

        let console = Console {
            transport: transport.clone(),
            session,
            files,
            calls: calls.clone(),
            broadcaster,
            audio: cfg.audio.clone(),
        };
        tokio::select! {
            _ = console.run() => {}
            r = shutdown_signal() => r?,
        }

        calls.shutdown().await;
        transport.close();
        // Let queued sends (CALL_END) reach the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::info!("shut down");
        Ok::<(), anyhow::Error>(())
    });
    // The stdin reader sits in a blocking thread; do not wait for it.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn print_events(mut rx: EventReceiver) {
    while let Some(ev) = rx.recv().await {
        println!("{}", ev);
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
