use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, trace, LevelFilter};
use tokio::sync::Mutex;

use bgprib::api::Api;
use bgprib::families::Family;
use bgprib::peer::PeerId;
use bgprib::tables::{SinkStatus, UpdateBuilder, UpdateSink};
use bgprib::routes::RouteMessage;
use bgprib::{config, Speaker};

#[derive(Parser)]
#[clap(name = "bgprib", version, about = "BGP route processing pipeline")]
struct Args {
    /// Path to the bgprib config
    #[clap(index = 1)]
    config_path: String,

    /// IP Address for the management API to listen on
    #[clap(short, long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// TCP port for the management API
    #[clap(short, long, default_value = "8179")]
    port: u16,

    /// Treat unresolved next-hops as reachable (no RIB client wired up)
    #[clap(long)]
    assume_reachable: bool,

    /// Sets the level of logging verbosity
    #[clap(short, parse(from_occurrences))]
    verbose: u64,
}

/// Send-side sink handing finalised UPDATEs to the codec; with no codec
/// attached they are drained and logged.
struct CodecSink {
    peer: PeerId,
    family: Family,
    builder: UpdateBuilder,
}

impl CodecSink {
    fn new(peer: PeerId, family: Family) -> Self {
        CodecSink {
            peer,
            family,
            builder: UpdateBuilder::new(family),
        }
    }
}

impl UpdateSink for CodecSink {
    fn start_packet(&mut self, ibgp: bool) {
        self.builder.start_packet(ibgp);
    }

    fn add_route(&mut self, msg: &RouteMessage, family: Family) {
        self.builder.add_route(msg, family);
    }

    fn replace_route(&mut self, old: &RouteMessage, new: &RouteMessage, family: Family) {
        self.builder.replace_route(old, new, family);
    }

    fn delete_route(&mut self, msg: &RouteMessage, family: Family) {
        self.builder.delete_route(msg, family);
    }

    fn push_packet(&mut self) -> SinkStatus {
        let status = self.builder.push_packet();
        for update in self.builder.take_updates() {
            debug!(
                "peer {} {}: UPDATE [{} announced, {} withdrawn, {} attrs]",
                self.peer,
                self.family,
                update.announced_routes.len(),
                update.withdrawn_routes.len(),
                update.attributes.len(),
            );
        }
        status
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let (bgprib_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgprib"), bgprib_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgprib_level, other_level);

    let config = config::from_file(&args.config_path)?;
    debug!(
        "Found {} peers in {}",
        config.peers.len(),
        args.config_path
    );

    let speaker = Speaker::new(
        &config,
        Box::new(|peer, family| Box::new(CodecSink::new(peer, family))),
        Instant::now(),
    );
    let speaker = Arc::new(Mutex::new(speaker));

    let api_addr = SocketAddr::new(args.address, args.port);
    let _api_handle = Api::new(Arc::clone(&speaker))
        .serve(api_addr)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::AddrInUse, err.to_string()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    // The cooperative pipeline pump: dispatch due work, resolve
    // next-hops when running standalone, and sleep until the next
    // deadline (or the next poll tick, whichever is sooner)
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    info!("Pipelines running");
    while !shutdown.load(Ordering::Relaxed) {
        ticker.tick().await;
        let now = Instant::now();
        let mut speaker = speaker.lock().await;
        if args.assume_reachable {
            for nexthop in speaker.pending_nexthops() {
                trace!("Assuming next-hop {} reachable", nexthop);
                speaker.nexthop_changed(nexthop, 0, now);
            }
        }
        while speaker.run_tasks(now) > 0 {}
    }

    info!("Shutting down");
    Ok(())
}
