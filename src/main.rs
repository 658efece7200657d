use anyhow::Error;
use clap::Parser;

use songq::catalog::SpotifyClient;
use songq::config::{ConfigContext, QueueConfig};
use songq::db::DbHandle;
use songq::orchestrator::{Orchestrator, Reply};
use songq::queue::{JobQueue, MemoryJobQueue};
use songq::refresh::{RefreshCoordinator, SpotifyTokenRefresher};
use songq::server::{self, Command, Consumers, Envelope, Response};
use songq::store::{MemoryStore, MetadataStore};
use songq::telemetry;
use songq::worker::LogSink;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

fn print_response(response: &Response) {
    match serde_json::to_string(response) {
        Ok(line) => println!("{}", line),
        Err(err) => error!(message = "Failed to encode response", error = ?err),
    }
}

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let (queue, store, db): (Arc<dyn JobQueue>, Arc<dyn MetadataStore>, Option<DbHandle>) =
        if config.in_memory {
            info!("Keeping queue and store in memory");
            (
                Arc::new(MemoryJobQueue::new()) as Arc<dyn JobQueue>,
                Arc::new(MemoryStore::new()) as Arc<dyn MetadataStore>,
                None,
            )
        } else {
            let queue_config = QueueConfig::from_url(&config.connect_url)?;
            let handle = DbHandle::new(&queue_config, config.max_connections).await?;
            (
                Arc::new(handle.clone()) as Arc<dyn JobQueue>,
                Arc::new(handle.clone()) as Arc<dyn MetadataStore>,
                Some(handle),
            )
        };

    let refresher = Arc::new(SpotifyTokenRefresher::new(
        http.clone(),
        config.spotify_client_id.clone(),
        config.spotify_client_secret.clone(),
        store.clone(),
    ));
    let (refresh, refresh_spawn) =
        RefreshCoordinator::spawn(cancel_token.clone(), refresher, config.refresh_workers);

    let orchestrator = Orchestrator::new(
        queue.clone(),
        store,
        Arc::new(SpotifyClient::new(http)),
        refresh,
    )
    .with_ack_mode(config.ack_mode);

    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    let consumers = Consumers {
        queue,
        sink: Arc::new(LogSink),
        topics: config.topics.clone(),
        poll_interval: Duration::from_millis(config.poll_interval_ms),
    };

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token, orchestrator, consumers, recv_from_client).await
                {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    // One JSON command per line on stdin, one JSON response per line on stdout
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Input Cancelled");
                break;
            },
            Some(joined) = printers.join_next(), if !printers.is_empty() => {
                if let Err(err) = joined {
                    error!(message = "Reply printer failed", error = ?err);
                }
            },
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let command = match serde_json::from_str::<Command>(&line) {
                            Ok(command) => command,
                            Err(err) => {
                                warn!(message = "Unreadable command", error = %err);
                                print_response(&Response::Catalog(Reply::Message {
                                    msg: err.to_string(),
                                }));
                                continue;
                            }
                        };
                        let (envelope, recv_reply) = Envelope::new(command);
                        send_to_server.send(envelope)?;
                        printers.spawn(async move {
                            match recv_reply.await {
                                Ok(response) => print_response(&response),
                                Err(_) => warn!("Request dropped without a response"),
                            }
                        });
                    },
                    Ok(None) => {
                        debug!("Input closed");
                        break;
                    },
                    Err(err) => {
                        error!(message = "Failed to read input", error = ?err);
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }
    }

    // The server answers what was already sent, then stops on its own unless
    // it runs consumers, which stop on cancellation.
    drop(send_to_server);
    info!("Waiting for server to shutdown...");
    server_spawn.await?;
    while let Some(joined) = printers.join_next().await {
        joined?;
    }

    cancel_token.cancel();
    refresh_spawn.await?;

    if let Some(db) = db {
        db.close().await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "songq=DEBUG");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!(message = "Cannot listen for signals", error = ?err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
