//! The tracker transport boundary: the core is agnostic to HTTP vs UDP
//! tracker protocols (§6 "Tracker transport"), so [`TrackerController`]
//! drives a [`TrackerTransport`] the embedder supplies rather than owning
//! `reqwest` calls directly. A [`HttpTrackerTransport`] default
//! implementation is provided since every tracker in practice is reached
//! over HTTP(S); UDP trackers are a `Non-goal` of this crate per the
//! specification and are left to a future transport implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};

/// Which lifecycle event this announce corresponds to (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
    Paused,
}

#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub num_want: Option<i32>,
    pub compact: bool,
}

#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ScrapeRequest {
    pub info_hash: Sha1Hash,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub downloaded: u32,
    pub incomplete: u32,
}

/// An external-facing tracker error, distinct from [`crate::error::Error`]
/// since the HTTP status code determines fail-limit handling in §4.6/§7
/// (a `410 Gone` response sets `fail_limit := 1`, i.e. never retry).
#[derive(Clone, Debug)]
pub struct TrackerHttpError {
    pub status: Option<u16>,
    pub message: String,
}

impl TrackerHttpError {
    /// §7: "Response code 410 sets `fail_limit := 1` (never retry)."
    pub fn is_permanent(&self) -> bool {
        self.status == Some(410)
    }
}

#[async_trait]
pub trait TrackerTransport: Send + Sync {
    async fn announce(
        &self,
        url: &str,
        req: &AnnounceRequest,
    ) -> std::result::Result<AnnounceResponse, TrackerHttpError>;

    async fn scrape(
        &self,
        url: &str,
        req: &ScrapeRequest,
    ) -> std::result::Result<ScrapeResponse, TrackerHttpError>;
}

/// A [`TrackerTransport`] backed by `reqwest`, matching the bencoded HTTP
/// tracker wire format (BEP 3) used by the overwhelming majority of public
/// and private trackers.
pub struct HttpTrackerTransport {
    client: reqwest::Client,
}

impl HttpTrackerTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_query(req: &AnnounceRequest) -> Vec<(&'static str, String)> {
        let event = match req.event {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Paused => Some("paused"),
        };
        let mut query = vec![
            ("port", req.port.to_string()),
            ("uploaded", req.uploaded.to_string()),
            ("downloaded", req.downloaded.to_string()),
            ("left", req.left.to_string()),
            ("compact", if req.compact { "1" } else { "0" }.to_string()),
        ];
        if let Some(event) = event {
            query.push(("event", event.to_string()));
        }
        if let Some(num_want) = req.num_want {
            query.push(("numwant", num_want.to_string()));
        }
        query
    }
}

impl Default for HttpTrackerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackerTransport for HttpTrackerTransport {
    async fn announce(
        &self,
        url: &str,
        req: &AnnounceRequest,
    ) -> std::result::Result<AnnounceResponse, TrackerHttpError> {
        let info_hash = percent_encoding::percent_encode(
            &req.info_hash,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();
        let peer_id = percent_encoding::percent_encode(
            &req.peer_id,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();

        let mut full_url = format!("{}?info_hash={}&peer_id={}", url, info_hash, peer_id);
        for (k, v) in Self::build_query(req) {
            full_url.push('&');
            full_url.push_str(k);
            full_url.push('=');
            full_url.push_str(&v);
        }

        let resp = self
            .client
            .get(&full_url)
            .send()
            .await
            .map_err(|e| TrackerHttpError {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerHttpError {
                status: Some(status.as_u16()),
                message: format!("tracker returned {}", status),
            });
        }

        let body = resp.bytes().await.map_err(|e| TrackerHttpError {
            status: None,
            message: e.to_string(),
        })?;

        parse_announce_response(&body).map_err(|e| TrackerHttpError {
            status: None,
            message: e.to_string(),
        })
    }

    async fn scrape(
        &self,
        url: &str,
        req: &ScrapeRequest,
    ) -> std::result::Result<ScrapeResponse, TrackerHttpError> {
        let info_hash = percent_encoding::percent_encode(
            &req.info_hash,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();
        let full_url = format!("{}?info_hash={}", url, info_hash);

        let resp = self
            .client
            .get(&full_url)
            .send()
            .await
            .map_err(|e| TrackerHttpError {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerHttpError {
                status: Some(status.as_u16()),
                message: format!("tracker returned {}", status),
            });
        }
        let body = resp.bytes().await.map_err(|e| TrackerHttpError {
            status: None,
            message: e.to_string(),
        })?;

        parse_scrape_response(&body).map_err(|e| TrackerHttpError {
            status: None,
            message: e.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct RawAnnounceResponse {
    interval: u32,
    #[serde(rename = "min interval")]
    min_interval: Option<u32>,
    #[serde(default, with = "serde_bytes")]
    peers: Vec<u8>,
    complete: Option<u32>,
    incomplete: Option<u32>,
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let raw: RawAnnounceResponse = serde_bencode::from_bytes(body)?;
    let peers = raw
        .peers
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect();
    Ok(AnnounceResponse {
        interval: raw.interval,
        min_interval: raw.min_interval,
        peers,
        complete: raw.complete,
        incomplete: raw.incomplete,
    })
}

#[derive(Deserialize)]
struct RawScrapeResponse {
    files: HashMap<String, RawScrapeFile>,
}

#[derive(Deserialize)]
struct RawScrapeFile {
    complete: u32,
    downloaded: u32,
    incomplete: u32,
}

fn parse_scrape_response(body: &[u8]) -> Result<ScrapeResponse> {
    let raw: RawScrapeResponse = serde_bencode::from_bytes(body)?;
    let file = raw
        .files
        .values()
        .next()
        .ok_or_else(|| Error::TrackerError("scrape response missing file entry".into()))?;
    Ok(ScrapeResponse {
        complete: file.complete,
        downloaded: file.downloaded,
        incomplete: file.incomplete,
    })
}
