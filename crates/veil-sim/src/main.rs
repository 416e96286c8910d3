mod events;
mod network;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tokio::time::timeout;
use veil_destination::{
    Destination, DestinationChannels, DestinationConfig, DestinationEvent, DestinationHandle,
    IdentHash, PrivateKeys,
};

use events::{emit, EventDestination, EventStarted, EventStep, EventSummary};
use network::Network;

#[derive(Parser)]
#[command(
    name = "veil-sim",
    about = "Exercise Veil client destinations on a simulated overlay"
)]
struct Cli {
    /// Number of directory (floodfill) nodes.
    #[arg(long, default_value = "5")]
    floodfills: u8,

    /// Inbound tunnels per destination.
    #[arg(long, default_value = "2")]
    inbound: usize,

    /// Swallow the first N store confirmations (exercises publish retry).
    #[arg(long, default_value = "0")]
    drop_confirmations: u32,

    /// Seconds to wait for any single step.
    #[arg(long, default_value = "60")]
    step_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish both lease sets and wait for confirmation.
    Publish,

    /// Resolve bob's lease set from alice.
    Lookup {
        /// Look up an identity nobody published.
        #[arg(long)]
        missing: bool,
    },

    /// Open a stream alice → bob and echo payloads back.
    Echo {
        #[arg(long, default_value = "10")]
        count: u32,
        #[arg(long, default_value = "1024")]
        payload_size: usize,
    },

    /// Send signed datagrams alice → bob.
    Datagram {
        #[arg(long, default_value = "10")]
        count: u32,
    },

    /// Every step in sequence.
    All,
}

struct Node {
    name: &'static str,
    destination: Destination,
}

impl Node {
    fn handle(&self) -> DestinationHandle {
        self.destination.handle()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.floodfills == 0 {
        bail!("at least one floodfill is required");
    }
    let step_timeout = Duration::from_secs(cli.step_timeout);

    eprintln!("veil-sim v{}", env!("CARGO_PKG_VERSION"));

    let net = Network::new(cli.floodfills, cli.drop_confirmations);
    let bob = start(&net, "bob", cli.inbound);
    let alice = start(&net, "alice", cli.inbound);

    let outcome = async {
        publish(&[&bob, &alice], step_timeout).await?;
        match cli.command {
            Command::Publish => Ok(()),
            Command::Lookup { missing } => lookup(&alice, &bob, missing, step_timeout).await,
            Command::Echo {
                count,
                payload_size,
            } => echo(&alice, &bob, count, payload_size, step_timeout).await,
            Command::Datagram { count } => datagram(&alice, &bob, count, step_timeout).await,
            Command::All => {
                lookup(&alice, &bob, false, step_timeout).await?;
                lookup(&alice, &bob, true, step_timeout).await?;
                echo(&alice, &bob, 10, 1024, step_timeout).await?;
                datagram(&alice, &bob, 10, step_timeout).await
            }
        }
    }
    .await;

    for node in [&alice, &bob] {
        emit(&EventSummary::new(node.name, node.handle().stats()));
    }
    alice.destination.stop().await;
    bob.destination.stop().await;
    outcome
}

fn start(net: &Arc<Network>, name: &'static str, inbound: usize) -> Node {
    let keys = PrivateKeys::generate();
    let config = DestinationConfig::new().public(true);
    let DestinationChannels {
        destination,
        mut events,
    } = net.spawn(keys, config, inbound);
    emit(&EventStarted::new(
        name,
        &destination.ident_hash().to_string(),
        true,
    ));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let DestinationEvent::Error { description } = &event {
                tracing::warn!("{name}: {description}");
            }
            emit(&EventDestination::new(name, format!("{event:?}")));
        }
    });

    Node { name, destination }
}

async fn publish(nodes: &[&Node], step_timeout: Duration) -> anyhow::Result<()> {
    let started = Instant::now();
    for node in nodes {
        let handle = node.handle();
        timeout(step_timeout, async {
            while handle.stats().publishes_confirmed.get() == 0 || !handle.is_ready().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .with_context(|| format!("{} never got a store confirmation", node.name))?;
    }
    emit(&EventStep::new(
        "publish",
        true,
        elapsed_ms(started),
        format!("{} destinations published", nodes.len()),
    ));
    Ok(())
}

async fn lookup(alice: &Node, bob: &Node, missing: bool, step_timeout: Duration) -> anyhow::Result<()> {
    let target = if missing {
        IdentHash::from_bytes(rand::random())
    } else {
        bob.destination.ident_hash()
    };
    let started = Instant::now();
    let result = timeout(step_timeout, alice.handle().request_destination(target))
        .await
        .context("lookup did not finish")?;

    let ok = result.is_some() != missing;
    let detail = match &result {
        Some(lease_set) => format!("{target}: {} leases", lease_set.leases.len()),
        None => format!("{target}: not found"),
    };
    emit(&EventStep::new("lookup", ok, elapsed_ms(started), detail));
    if !ok {
        bail!("unexpected lookup result for {target}");
    }
    Ok(())
}

async fn echo(
    alice: &Node,
    bob: &Node,
    count: u32,
    payload_size: usize,
    step_timeout: Duration,
) -> anyhow::Result<()> {
    let mut incoming = bob.handle().accept_streams().await?;
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.recv().await {
            tokio::spawn(async move {
                while let Some(chunk) = stream.recv().await {
                    if stream.send(&chunk).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let started = Instant::now();
    let mut stream = alice
        .handle()
        .create_stream(bob.destination.ident_hash(), 0)
        .await?;
    for i in 0..count {
        let payload: Vec<u8> = (0..payload_size).map(|_| rand::random()).collect();
        stream.send(&payload)?;
        let echoed = timeout(step_timeout, stream.recv())
            .await
            .with_context(|| format!("no echo for message {i}"))?
            .ok_or_else(|| anyhow!("stream closed after {i} messages"))?;
        if echoed != payload {
            bail!("echo {i} does not match");
        }
    }
    stream.close()?;

    emit(&EventStep::new(
        "echo",
        true,
        elapsed_ms(started),
        format!("{count} x {payload_size} bytes"),
    ));
    Ok(())
}

async fn datagram(alice: &Node, bob: &Node, count: u32, step_timeout: Duration) -> anyhow::Result<()> {
    let (_bob_dgram, mut inbox) = bob
        .handle()
        .create_datagram_destination(count as usize)
        .await?;
    let (alice_dgram, _alice_inbox) = alice.handle().create_datagram_destination(1).await?;

    let started = Instant::now();
    let target = bob.destination.ident_hash();
    for i in 0..count {
        alice_dgram.send_datagram(target, 1, 2, format!("datagram {i}").as_bytes())?;
    }

    let mut received = 0;
    while received < count {
        let datagram = timeout(step_timeout, inbox.recv())
            .await
            .with_context(|| format!("only {received}/{count} datagrams arrived"))?
            .ok_or_else(|| anyhow!("datagram channel closed"))?;
        if datagram.from != Some(alice.destination.ident_hash()) {
            bail!("datagram from unexpected sender {:?}", datagram.from);
        }
        received += 1;
    }

    emit(&EventStep::new(
        "datagram",
        true,
        elapsed_ms(started),
        format!("{count} signed datagrams"),
    ));
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
