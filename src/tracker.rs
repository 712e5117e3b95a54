use crate::bencode::{self, BencodeError, Value};
use crate::identity::ClientIdentity;
use crate::metainfo::Metainfo;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

// Re-announce backoff after a network failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(15);
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
    Periodic,
}

impl Event {
    fn as_param(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
            Event::Periodic => None,
        }
    }
}

// NOTE: `info_hash` and `peer_id` are not fields here. They are appended to
// the URL by hand because urlencoding libraries escape our raw octets as
// UTF-8 and mangle them.
#[derive(Debug, Serialize)]
struct QueryParams<'a> {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trackerid: Option<&'a str>,
}

/// One parsed announce response.
#[derive(Debug, Clone)]
pub struct Announce {
    // Seconds the client should wait between regular announces.
    pub interval: Duration,
    // If present, announces must not be sent more often than this.
    pub min_interval: Option<Duration>,
    // Echoed back on subsequent announces once received.
    pub tracker_id: Option<String>,
    pub peers: Vec<SocketAddrV4>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
}

impl Announce {
    /// Effective wait before the next announce.
    pub fn next_announce_in(&self) -> Duration {
        self.min_interval
            .map_or(self.interval, |min| self.interval.max(min))
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker returned failure: {0}")]
    Failure(String),
    #[error("urlencode tracker parameters: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("announce timed out")]
    Timeout,
    #[error("tracker response: {0}")]
    Bencode(#[from] BencodeError),
    #[error("tracker response missing `{0}`")]
    MissingField(&'static str),
    #[error("tracker response field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("compact peer list length {0} is not a multiple of 6")]
    BadCompactLength(usize),
    #[error("no reachable tracker in any tier")]
    AllTiersFailed,
}

/// Announce client with BEP-12 tier failover. Tiers are tried in order;
/// trackers within a tier are shuffled on every cycle.
pub struct TrackerClient {
    http: reqwest::Client,
    tiers: Vec<Vec<String>>,
    info_hash: [u8; 20],
    identity: ClientIdentity,
    tracker_id: Option<String>,
}

impl TrackerClient {
    pub fn new(meta: &Metainfo, identity: ClientIdentity) -> Self {
        Self {
            http: reqwest::Client::new(),
            tiers: meta.tiers(),
            info_hash: meta.info_hash,
            identity,
            tracker_id: None,
        }
    }

    pub async fn announce(&mut self, event: Event) -> Result<Announce, TrackerError> {
        let mut last_err = TrackerError::AllTiersFailed;
        let mut tiers = self.tiers.clone();
        for tier in &mut tiers {
            tier.shuffle(&mut rand::rng());
            for url in tier.iter() {
                match self.announce_url(url, event).await {
                    Ok(announce) => {
                        if announce.tracker_id.is_some() {
                            // an absent id never clears a stored one
                            self.tracker_id = announce.tracker_id.clone();
                        }
                        return Ok(announce);
                    }
                    Err(err) => {
                        warn!(url = %url, error = %err, "announce failed, trying next tracker");
                        last_err = err;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn announce_url(&self, url: &str, event: Event) -> Result<Announce, TrackerError> {
        let stats = &self.identity.stats;
        let params = QueryParams {
            port: self.identity.port,
            uploaded: stats.uploaded(),
            downloaded: stats.downloaded(),
            left: stats.left(),
            compact: 1,
            event: event.as_param(),
            trackerid: self.tracker_id.as_deref(),
        };
        let url = build_announce_url(url, &params, &self.info_hash, &self.identity.peer_id)?;
        debug!(%url, "announcing");
        let request = async {
            let response = self.http.get(&url).send().await?;
            response.bytes().await.map_err(TrackerError::from)
        };
        let body = tokio::time::timeout(ANNOUNCE_TIMEOUT, request)
            .await
            .map_err(|_| TrackerError::Timeout)??;
        parse_response(&body)
    }
}

fn build_announce_url(
    announce: &str,
    params: &QueryParams<'_>,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
) -> Result<String, TrackerError> {
    let encoded = serde_urlencoded::to_string(params)?;
    let separator = if announce.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{announce}{separator}{encoded}&info_hash={}&peer_id={}",
        percent_encode(info_hash),
        percent_encode(peer_id),
    ))
}

/// Octet-by-octet percent encoding of a raw 20-byte value.
pub fn percent_encode(v: &[u8; 20]) -> String {
    let mut encoded = String::with_capacity(3 * v.len());
    for &byte in v {
        encoded.push('%');
        encoded.push_str(&hex::encode([byte]));
    }
    encoded
}

fn parse_response(body: &[u8]) -> Result<Announce, TrackerError> {
    let root = bencode::decode(body)?;
    if let Some(reason) = root.lookup(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(TrackerError::Failure(reason));
    }

    let interval = match root.lookup(b"interval").map(Value::as_int) {
        Some(Some(secs)) if secs >= 0 => Duration::from_secs(secs as u64),
        Some(_) => return Err(TrackerError::WrongType("interval")),
        None => return Err(TrackerError::MissingField("interval")),
    };
    let min_interval = match root.lookup(b"min interval").map(Value::as_int) {
        Some(Some(secs)) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
        Some(_) => return Err(TrackerError::WrongType("min interval")),
        None => None,
    };
    let tracker_id = root
        .lookup(b"tracker id")
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let complete = root
        .lookup(b"complete")
        .and_then(Value::as_int)
        .map(|n| n.max(0) as u64);
    let incomplete = root
        .lookup(b"incomplete")
        .and_then(Value::as_int)
        .map(|n| n.max(0) as u64);

    let peers = match root.lookup(b"peers") {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact)?,
        Some(Value::List(dicts)) => parse_dict_peers(dicts),
        Some(_) => return Err(TrackerError::WrongType("peers")),
        None => return Err(TrackerError::MissingField("peers")),
    };

    Ok(Announce {
        interval,
        min_interval,
        tracker_id,
        peers,
        complete,
        incomplete,
    })
}

/// 6 bytes per peer: 4-byte IPv4 then 2-byte port, network byte order.
// TODO: also read the `peers6` key (BEP-7) for IPv6 swarms
fn parse_compact_peers(compact: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if compact.len() % 6 != 0 {
        return Err(TrackerError::BadCompactLength(compact.len()));
    }
    Ok(compact
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

// Dictionary form: entries with `ip` and `port`. Entries whose ip is not a
// literal IPv4 address (hostnames, IPv6) are skipped.
fn parse_dict_peers(dicts: &[Value]) -> Vec<SocketAddrV4> {
    dicts
        .iter()
        .filter_map(|peer| {
            let ip = peer.lookup(b"ip")?.as_bytes()?;
            let ip: Ipv4Addr = std::str::from_utf8(ip).ok()?.parse().ok()?;
            let port = peer.lookup(b"port")?.as_int()?;
            let port = u16::try_from(port).ok()?;
            Some(SocketAddrV4::new(ip, port))
        })
        .collect()
}
