//! `dsvc demo`: local clients exchanging publishes, requests, and responses.
//!
//! `client_0` publishes to `/scanners` every tick, sends a request to
//! `client_1` every 5th tick and a broadcast request every 11th tick.
//! `client_1` subscribes to `/scanners`. Every client answers the requests it
//! receives. When a tunnel is configured, simulated remote peers attached to
//! the in-process endpoint send a request to `client_1` on every tick.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use delivery_core::tunnel::{decode_message, encode_message};
use delivery_core::{DeliveryService, Participant, SubscriptionMatcher, TableKind, Transportable};
use delivery_infra::config::load_config;
use delivery_infra::tunnel::{MemoryTunnelEndpoint, SessionReceiver};
use delivery_types::message::BROADCAST;
use delivery_types::transport::TransportType;
use delivery_types::{Message, MimeType};

use super::DemoArgs;
use super::tables::{print_snapshot, print_subscriptions};

const SCANNERS: &str = "/scanners";

/// What the demo clients did during the run.
#[derive(Debug, Default, Serialize)]
pub struct DemoSummary {
    pub ticks: u64,
    pub published: u64,
    pub requests_sent: u64,
    pub requests_answered: u64,
    pub publishes_received: u64,
    pub responses_received: u64,
    pub remote_requests_sent: u64,
    pub remote_responses_received: u64,
}

struct RemotePeer {
    uri: String,
    session_id: String,
    rx: SessionReceiver,
}

struct Demo {
    service: Arc<DeliveryService>,
    endpoint: Arc<MemoryTunnelEndpoint>,
    clients: Vec<Participant>,
    peers: Vec<RemotePeer>,
    summary: DemoSummary,
}

impl Demo {
    fn new(
        service: &Arc<DeliveryService>,
        endpoint: &Arc<MemoryTunnelEndpoint>,
        args: &DemoArgs,
    ) -> Result<Self> {
        let mut clients = Vec::with_capacity(args.clients.max(1));
        for i in 0..args.clients.max(1) {
            let mut client = Participant::with_uri(format!("client_{i}"));
            client
                .connect(service, TransportType::Local)
                .with_context(|| format!("failed to connect client_{i}"))?;
            clients.push(client);
        }
        if let Some(scanner) = clients.get(1) {
            scanner.subscribe(SubscriptionMatcher::destination(SCANNERS), Some(SCANNERS))?;
        }

        let mut peers = Vec::new();
        if endpoint.is_started() {
            for i in 0..args.remote_peers {
                let session_id = (i + 1).to_string();
                let peer_address = format!("10.1.{}.{}", i / 256, i % 256);
                let rx = endpoint
                    .connect_session(&session_id, &peer_address)
                    .with_context(|| format!("failed to attach remote peer {i}"))?;
                peers.push(RemotePeer {
                    uri: format!("remote_{i}"),
                    session_id,
                    rx,
                });
            }
        } else if args.remote_peers > 0 {
            warn!("remote peers need a tunnel configuration, none attached");
        }

        Ok(Self {
            service: Arc::clone(service),
            endpoint: Arc::clone(endpoint),
            clients,
            peers,
            summary: DemoSummary::default(),
        })
    }

    fn target_uri(&self) -> String {
        let target = self.clients.get(1).unwrap_or(&self.clients[0]);
        target.uri().to_string()
    }

    fn tick(&mut self) -> Result<()> {
        self.collect()?;
        self.summary.ticks += 1;
        let tick = self.summary.ticks;
        let target = self.target_uri();
        let sender = &self.clients[0];

        sender.publish(Message::publish(sender.uri(), SCANNERS, json!({ "tick": tick })))?;
        self.summary.published += 1;

        if tick % 5 == 0 {
            let transaction_id = sender.request(target.as_str(), json!({ "tick": tick }))?;
            debug!(tick, %transaction_id, "request sent");
            self.summary.requests_sent += 1;
        }

        if tick % 11 == 0 {
            let transaction_id =
                sender.request(BROADCAST, json!({ "tick": tick, "ping": "everyone" }))?;
            debug!(tick, %transaction_id, "broadcast request sent");
            self.summary.requests_sent += 1;
        }

        for peer in &self.peers {
            let request = self.service.new_request(
                peer.uri.as_str(),
                target.as_str(),
                json!({ "tick": tick, "remote": true }),
                None,
            );
            self.endpoint
                .inject(&peer.session_id, &encode_message(&request)?)?;
            self.summary.remote_requests_sent += 1;
        }

        info!(
            tick,
            pending = self.clients.iter().map(Participant::pending).sum::<usize>(),
            "demo tick"
        );
        Ok(())
    }

    /// Drain every mailbox, answering requests.
    fn collect(&mut self) -> Result<()> {
        let tick = self.summary.ticks;
        for client in &mut self.clients {
            for message in client.drain() {
                match message.mime_type() {
                    Some(MimeType::Request) => {
                        client.respond(
                            &message,
                            json!({ "answered_by": client.uri(), "tick": tick }),
                        )?;
                        self.summary.requests_answered += 1;
                    }
                    Some(MimeType::Response) => self.summary.responses_received += 1,
                    Some(MimeType::Publish) => self.summary.publishes_received += 1,
                    None => {}
                }
            }
        }

        for peer in &mut self.peers {
            while let Ok(payload) = peer.rx.try_recv() {
                match decode_message(&payload) {
                    Ok(message) if message.mime_type() == Some(MimeType::Response) => {
                        self.summary.remote_responses_received += 1;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(peer = %peer.uri, error = %err, "bad tunnel payload"),
                }
            }
        }
        Ok(())
    }
}

/// Run the demo and print the registries and counters.
pub async fn run(config_path: &Path, args: DemoArgs, json: bool) -> Result<()> {
    let mut config = load_config(config_path).await;
    args.tunnel.apply(&mut config)?;

    let endpoint = MemoryTunnelEndpoint::new();
    let mut builder = DeliveryService::builder(config.clone());
    if config.tunnel.is_some() {
        builder = builder.tunnel_endpoint(endpoint.clone());
    }
    let service = builder
        .start()
        .context("failed to start the delivery service")?;

    let mut demo = Demo::new(&service, &endpoint, &args)?;

    let stop = CancellationToken::new();
    if args.ticks == 0 {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
        if !json {
            println!("  {}", style("Press Ctrl+C to stop").dim());
        }
    }

    let service_stopped = service.cancellation_token();
    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = service_stopped.cancelled() => break,
            _ = interval.tick() => {}
        }
        demo.tick()?;
        if args.ticks != 0 && demo.summary.ticks >= args.ticks {
            break;
        }
    }

    // Requests from the last tick need one round to be answered and one for the answers.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(args.tick_ms.clamp(1, 100))).await;
        demo.collect()?;
    }

    if json {
        let subscriptions: serde_json::Map<String, serde_json::Value> = TableKind::ALL
            .iter()
            .map(|kind| -> Result<(String, serde_json::Value)> {
                let rows = service.subscription_rows(*kind);
                Ok((kind.name().to_string(), serde_json::to_value(rows)?))
            })
            .collect::<Result<_>>()?;
        let report = json!({
            "summary": demo.summary,
            "service": service.snapshot(),
            "subscriptions": subscriptions,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&demo.summary, demo.clients.len(), demo.peers.len());
        for kind in TableKind::ALL {
            print_subscriptions(kind, &service.subscription_rows(kind));
        }
        print_snapshot(&service.snapshot());
    }

    service.shutdown().await;
    Ok(())
}

fn print_summary(summary: &DemoSummary, clients: usize, peers: usize) {
    println!();
    println!(
        "  {} Delivery service demo v{}",
        style("⚡").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("  {}", style("── Run ──").dim());
    println!("  Ticks:     {}", style(summary.ticks).bold());
    println!("  Clients:   {}", style(clients).bold());
    if peers > 0 {
        println!("  Remotes:   {}", style(peers).bold());
    }
    println!();
    println!("  {}", style("── Traffic ──").dim());
    println!("  Published:          {}", summary.published);
    println!("  Publishes received: {}", summary.publishes_received);
    println!("  Requests sent:      {}", summary.requests_sent);
    println!("  Requests answered:  {}", summary.requests_answered);
    println!(
        "  Responses received: {}",
        style(summary.responses_received).green()
    );
    if peers > 0 {
        println!("  Remote requests:    {}", summary.remote_requests_sent);
        println!(
            "  Remote responses:   {}",
            style(summary.remote_responses_received).green()
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::TunnelArgs;
    use delivery_types::config::{DeliveryConfig, TunnelConfig};

    fn args(clients: usize, remote_peers: usize) -> DemoArgs {
        DemoArgs {
            clients,
            ticks: 11,
            tick_ms: 1,
            remote_peers,
            tunnel: TunnelArgs::default(),
        }
    }

    async fn settle(demo: &mut Demo) {
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            demo.collect().unwrap();
        }
    }

    #[tokio::test]
    async fn eleven_ticks_exchange_requests_and_responses() {
        let service = DeliveryService::start(DeliveryConfig::default()).unwrap();
        let endpoint = MemoryTunnelEndpoint::new();
        let mut demo = Demo::new(&service, &endpoint, &args(3, 0)).unwrap();

        for _ in 0..11 {
            demo.tick().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        settle(&mut demo).await;

        let summary = &demo.summary;
        assert_eq!(summary.ticks, 11);
        assert_eq!(summary.published, 11);
        assert_eq!(summary.publishes_received, 11);
        // Direct requests on ticks 5 and 10, a broadcast request on tick 11.
        assert_eq!(summary.requests_sent, 3);
        assert_eq!(summary.requests_answered, 2 + 3);
        assert_eq!(summary.responses_received, 5);
        assert_eq!(
            service.subscription_count(TableKind::Transactions),
            3,
            "transactions stay registered until they expire"
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn remote_peers_get_answers_through_the_tunnel() {
        let endpoint = MemoryTunnelEndpoint::new();
        let config = DeliveryConfig {
            tunnel: Some(TunnelConfig::server(
                std::env::temp_dir(),
                "127.0.0.1",
                44000,
                44001,
                55000,
                2,
            )),
            ..DeliveryConfig::default()
        };
        let service = DeliveryService::builder(config)
            .tunnel_endpoint(endpoint.clone())
            .start()
            .unwrap();
        let mut demo = Demo::new(&service, &endpoint, &args(2, 2)).unwrap();

        demo.tick().unwrap();
        settle(&mut demo).await;

        assert_eq!(demo.summary.remote_requests_sent, 2);
        assert_eq!(demo.summary.remote_responses_received, 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn single_client_targets_itself() {
        let service = DeliveryService::start(DeliveryConfig::default()).unwrap();
        let endpoint = MemoryTunnelEndpoint::new();
        let mut demo = Demo::new(&service, &endpoint, &args(1, 0)).unwrap();

        for _ in 0..5 {
            demo.tick().unwrap();
        }
        settle(&mut demo).await;

        assert_eq!(demo.summary.requests_answered, 1);
        assert_eq!(demo.summary.responses_received, 1);
        assert_eq!(demo.summary.publishes_received, 0);
        service.shutdown().await;
    }
}
