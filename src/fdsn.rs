use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::config::ResolvedConfig;
use crate::domain::{NetworkCode, StationCode};
use crate::error::InventoryError;

const STATION_QUERY_PATH: &str = "/fdsnws/station/1/query";

/// One FDSN data center and the networks it is authoritative for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdsnSource {
    pub base_url: String,
    pub networks: Vec<NetworkCode>,
}

pub trait FdsnClient: Send + Sync {
    /// StationXML at response level for one station.
    fn fetch_station_metadata(
        &self,
        network: &NetworkCode,
        station: &StationCode,
    ) -> Result<Vec<u8>, InventoryError>;

    /// Station codes the data center currently lists for `network`.
    fn list_network_stations(
        &self,
        network: &NetworkCode,
    ) -> Result<BTreeSet<String>, InventoryError>;
}

pub fn default_sources() -> Vec<FdsnSource> {
    let table: [(&str, &[&str]); 10] = [
        ("http://auspass.edu.au:80", &["M8", "S1"]),
        ("https://data.raspberryshake.org", &["AM"]),
        ("http://geofon.gfz-potsdam.de", &["GE"]),
        ("https://geof.bmkg.go.id", &["IA"]),
        ("http://seisrequest.iag.usp.br", &["BL", "BR"]),
        ("http://seis-pub.ga.gov.au:8081", &["AU", "2O", "3B", "YW"]),
        (
            "https://service.iris.edu",
            &[
                "AF", "AI", "AK", "AT", "BK", "BL", "C", "C1", "CM", "CN", "CU", "EC", "EI", "GB",
                "GI", "GT", "HK", "HV", "IC", "II", "IM", "IN", "IO", "IU", "JP", "KG", "KZ", "MI",
                "MM", "MX", "MY", "NK", "NN", "NO", "ON", "OV", "PB", "PL", "PM", "PS", "PT", "RM",
                "TC", "TM", "TW", "US", "UW", "VU", "YC",
            ],
        ),
        ("http://webservices.ingv.it", &["MN"]),
        ("https://service.geonet.org.nz", &["NZ"]),
        ("http://ws.resif.fr", &["G", "ND"]),
    ];
    table
        .iter()
        .map(|(url, networks)| FdsnSource {
            base_url: url.to_string(),
            networks: networks
                .iter()
                .filter_map(|code| code.parse().ok())
                .collect(),
        })
        .collect()
}

/// First source listing `network`, or `default_source`.
pub fn resolve_source<'a>(
    sources: &'a [FdsnSource],
    default_source: &'a str,
    network: &NetworkCode,
) -> &'a str {
    sources
        .iter()
        .find(|source| source.networks.contains(network))
        .map(|source| source.base_url.as_str())
        .unwrap_or(default_source)
}

#[derive(Clone)]
pub struct FdsnHttpClient {
    client: Client,
    sources: Vec<FdsnSource>,
    default_source: String,
    start_time: String,
    end_time: String,
}

impl FdsnHttpClient {
    pub fn new(config: &ResolvedConfig) -> Result<Self, InventoryError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("station-inventory/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| InventoryError::Fetch(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| InventoryError::Fetch(err.to_string()))?;
        Ok(Self {
            client,
            sources: config.sources.clone(),
            default_source: config.default_source.clone(),
            start_time: config.start_time.clone(),
            end_time: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        })
    }

    pub fn query_url(&self, network: &NetworkCode) -> String {
        let base = resolve_source(&self.sources, &self.default_source, network);
        format!("{base}{STATION_QUERY_PATH}")
    }

    /// Runs a station query, dropping `includerestricted` once if the server
    /// rejects it.
    fn query(
        &self,
        network: &NetworkCode,
        station: Option<&StationCode>,
        level: &str,
    ) -> Result<Vec<u8>, InventoryError> {
        let url = self.query_url(network);
        let target = match station {
            Some(station) => format!("{network}.{station}"),
            None => network.to_string(),
        };
        let mut params = vec![
            ("network", network.to_string()),
            ("starttime", self.start_time.clone()),
            ("endtime", self.end_time.clone()),
            ("level", level.to_string()),
        ];
        if let Some(station) = station {
            params.push(("station", station.to_string()));
        }

        let mut restricted = params.clone();
        restricted.push(("includerestricted", "true".to_string()));
        tracing::debug!(url = %url, target = %target, level, "fdsn request");
        let response = self.send_with_retries(|| self.client.get(&url).query(&restricted))?;
        match Self::handle_status(response, &target) {
            Err(InventoryError::FetchStatus { status, message })
                if rejects_includerestricted(status, &message) =>
            {
                tracing::info!(
                    url = %url,
                    "server does not support includerestricted, retrying without it"
                );
                let response = self.send_with_retries(|| self.client.get(&url).query(&params))?;
                Self::handle_status(response, &target)
            }
            other => other,
        }
    }

    fn handle_status(response: Response, target: &str) -> Result<Vec<u8>, InventoryError> {
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|err| InventoryError::Fetch(err.to_string()))?;
        classify_response(status, &body, target)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, InventoryError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, delay_ms = delay, "retrying FDSN request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, delay_ms = delay, "retrying FDSN request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(InventoryError::Fetch(err.to_string()));
                }
            }
        }
    }
}

impl FdsnClient for FdsnHttpClient {
    fn fetch_station_metadata(
        &self,
        network: &NetworkCode,
        station: &StationCode,
    ) -> Result<Vec<u8>, InventoryError> {
        self.query(network, Some(station), "response")
    }

    fn list_network_stations(
        &self,
        network: &NetworkCode,
    ) -> Result<BTreeSet<String>, InventoryError> {
        let body = self.query(network, None, "station")?;
        let text = String::from_utf8_lossy(&body);
        station_codes(&text)
    }
}

/// A 400 whose message names `includerestricted` means the server does not
/// know the parameter.
fn rejects_includerestricted(status: u16, message: &str) -> bool {
    status == StatusCode::BAD_REQUEST.as_u16()
        && message.to_lowercase().contains("includerestricted")
}

fn classify_response(
    status: StatusCode,
    body: &[u8],
    target: &str,
) -> Result<Vec<u8>, InventoryError> {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
        return Err(InventoryError::NoData(target.to_string()));
    }
    if !status.is_success() {
        let message = String::from_utf8_lossy(body).trim().to_string();
        return Err(InventoryError::FetchStatus {
            status: status.as_u16(),
            message: if message.is_empty() {
                "FDSN request failed".to_string()
            } else {
                message
            },
        });
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(InventoryError::NoData(target.to_string()));
    }
    Ok(body.to_vec())
}

#[derive(Debug, Deserialize)]
struct StationXmlDocument {
    #[serde(rename = "Network", default)]
    networks: Vec<StationXmlNetwork>,
}

#[derive(Debug, Deserialize)]
struct StationXmlNetwork {
    #[serde(rename = "Station", default)]
    stations: Vec<StationXmlStation>,
}

#[derive(Debug, Deserialize)]
struct StationXmlStation {
    #[serde(rename = "@code")]
    code: String,
}

/// Station codes declared in a StationXML document.
pub fn station_codes(document: &str) -> Result<BTreeSet<String>, InventoryError> {
    let document: StationXmlDocument = quick_xml::de::from_str(document)
        .map_err(|err| InventoryError::Fetch(format!("invalid StationXML response: {err}")))?;
    Ok(document
        .networks
        .into_iter()
        .flat_map(|network| network.stations)
        .map(|station| station.code)
        .collect())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
