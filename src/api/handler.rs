use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bgp_rs::{AFI, SAFI};
use jsonrpsee::core::{async_trait, Error, RpcResult};
use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};
use log::info;
use tokio::sync::Mutex;

use super::rpc::{
    ApiServer, BranchInfo, DampingEntry, PeerInfo, PipelineInfo, RouteEntry, RouteSpec,
};
use crate::attributes::{AsPath, Attribute, AttributeList, Community, CommunityList, PathOrigin};
use crate::families::Family;
use crate::speaker::Speaker;
use crate::utils::asn_from_dotted;

/// The management RPC surface over a shared speaker
pub struct Api {
    speaker: Arc<Mutex<Speaker>>,
}

impl Api {
    pub fn new(speaker: Arc<Mutex<Speaker>>) -> Self {
        Api { speaker }
    }

    /// Serve the API, returning the server handle
    pub async fn serve(self, addr: SocketAddr) -> Result<HttpServerHandle, Error> {
        let server = HttpServerBuilder::default().build(addr).await?;
        info!("API listening on {}", addr);
        server.start(self.into_rpc())
    }
}

fn family_from_str(family: &str) -> RpcResult<Family> {
    let parts: Vec<&str> = family.trim().split_whitespace().collect();
    if parts.len() != 2 {
        return Err(Error::Custom(format!("Invalid family: '{}'", family)));
    }
    let afi = match parts[0] {
        "ipv4" => AFI::IPV4,
        "ipv6" => AFI::IPV6,
        other => return Err(Error::Custom(format!("Unsupported AFI: '{}'", other))),
    };
    let safi = match parts[1] {
        "unicast" => SAFI::Unicast,
        "multicast" => SAFI::Multicast,
        other => return Err(Error::Custom(format!("Unsupported SAFI: '{}'", other))),
    };
    Ok(Family::new(afi, safi))
}

fn attributes_from_spec(spec: &RouteSpec) -> RpcResult<AttributeList> {
    let mut attributes = vec![
        Attribute::NextHop(spec.next_hop),
        Attribute::Origin(
            spec.origin
                .as_deref()
                .map(|origin| match origin.to_lowercase().as_str() {
                    "igp" => PathOrigin::Igp,
                    "egp" => PathOrigin::Egp,
                    _ => PathOrigin::Incomplete,
                })
                .unwrap_or(PathOrigin::Igp),
        ),
    ];
    let mut asns: Vec<u32> = Vec::with_capacity(spec.as_path.len());
    for asn in &spec.as_path {
        asns.push(
            asn_from_dotted(asn).map_err(|err| Error::Custom(format!("Invalid ASN: {}", err)))?,
        );
    }
    attributes.push(Attribute::AsPath(AsPath::from_sequence(asns)));
    if let Some(local_pref) = spec.local_pref {
        attributes.push(Attribute::LocalPref(local_pref));
    }
    if let Some(med) = spec.multi_exit_disc {
        attributes.push(Attribute::Med(med));
    }
    if !spec.communities.is_empty() {
        let mut communities = Vec::with_capacity(spec.communities.len());
        for community in &spec.communities {
            communities.push(
                Community::try_from(community.as_str())
                    .map_err(|err| Error::Custom(format!("Invalid community: {}", err)))?,
            );
        }
        attributes.push(Attribute::Communities(CommunityList(communities)));
    }
    Ok(AttributeList::new(attributes))
}

#[async_trait]
impl ApiServer for Api {
    async fn show_peers(&self) -> RpcResult<Vec<PeerInfo>> {
        let speaker = self.speaker.lock().await;
        Ok(speaker
            .peer_summaries()
            .into_iter()
            .map(|summary| PeerInfo {
                peer: summary.peer,
                peer_type: summary.peer_type,
                remote_as: summary.remote_as,
                enabled: summary.enabled,
                up: summary.up,
                genid: summary.genid,
                msg_received: summary.msg_received,
                uptime: summary.uptime,
                prefixes_received: summary.prefixes_received,
                prefixes_damped: summary.prefixes_damped,
            })
            .collect())
    }

    async fn show_pipeline(&self) -> RpcResult<Vec<PipelineInfo>> {
        let speaker = self.speaker.lock().await;
        Ok(speaker
            .pipeline_stats()
            .into_iter()
            .map(|(family, stats)| PipelineInfo {
                family: family.to_string(),
                peers: stats.peers,
                winners: stats.winners,
                queue_len: stats.queue_len,
                held_nexthops: stats.held_nexthops,
                branches: stats
                    .branches
                    .into_iter()
                    .map(|branch| BranchInfo {
                        peer: branch.peer,
                        ready: branch.ready,
                        lag: branch.lag,
                        dumping: branch.dumping,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn show_damping(&self, family: String) -> RpcResult<Vec<DampingEntry>> {
        let family = family_from_str(&family)?;
        let speaker = self.speaker.lock().await;
        speaker
            .damping_entries(family, Instant::now())
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|(peer, net, merit, damped)| DampingEntry {
                        peer,
                        prefix: net.to_string(),
                        figure_of_merit: merit,
                        damped,
                    })
                    .collect()
            })
            .map_err(|err| Error::Custom(err.to_string()))
    }

    async fn create_route_reader(&self, family: String) -> RpcResult<u32> {
        let family = family_from_str(&family)?;
        let mut speaker = self.speaker.lock().await;
        speaker
            .create_route_reader(family)
            .map_err(|err| Error::Custom(err.to_string()))
    }

    async fn read_next(&self, token: u32) -> RpcResult<Option<RouteEntry>> {
        let mut speaker = self.speaker.lock().await;
        Ok(speaker.read_next(token).map(|entry| RouteEntry {
            peer: entry.peer,
            prefix: entry.net.to_string(),
            next_hop: entry.attributes.next_hop(),
            origin: entry.attributes.origin().to_string(),
            as_path: entry.attributes.as_path().to_string(),
            local_pref: entry.attributes.local_pref(),
            multi_exit_disc: entry.attributes.med(),
            communities: entry
                .attributes
                .communities()
                .map(|communities| {
                    communities
                        .iter()
                        .map(|community| community.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            winner: entry.winner,
        }))
    }

    async fn drop_route_reader(&self, token: u32) -> RpcResult<()> {
        let mut speaker = self.speaker.lock().await;
        speaker.drop_route_reader(token);
        Ok(())
    }

    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<()> {
        let prefix = route
            .prefix
            .parse()
            .map_err(|err| Error::Custom(format!("Invalid prefix: {}", err)))?;
        let family = match prefix {
            ipnetwork::IpNetwork::V4(_) => Family::new(AFI::IPV4, SAFI::Unicast),
            ipnetwork::IpNetwork::V6(_) => Family::new(AFI::IPV6, SAFI::Unicast),
        };
        let attributes = attributes_from_spec(&route)?;
        let mut speaker = self.speaker.lock().await;
        speaker
            .originate_route(family, prefix, attributes, Instant::now())
            .map_err(|err| Error::Custom(err.to_string()))
    }

    async fn withdraw_route(&self, family: String, prefix: String) -> RpcResult<()> {
        let family = family_from_str(&family)?;
        let prefix = prefix
            .parse()
            .map_err(|err| Error::Custom(format!("Invalid prefix: {}", err)))?;
        let mut speaker = self.speaker.lock().await;
        speaker
            .withdraw_originated_route(family, prefix, Instant::now())
            .map_err(|err| Error::Custom(err.to_string()))
    }
}
