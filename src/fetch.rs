//! swissALTI3D tile download through the swisstopo STAC search service.

use reqwest::blocking::Client;
use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::Bounds;

pub const SEARCH_URL: &str =
    "https://ogd.swisstopo.admin.ch/services/swiseld/services/assets/ch.swisstopo.swissalti3d/search";
const FORMAT: &str = "image/tiff; application=geotiff; profile=cloud-optimized";
const RESOLUTION: &str = "0.5";
const SRID: &str = "2056";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    ass_asset_href: String,
}

/// Search URL for every tile intersecting `bounds` (LV95 metres).
pub fn search_url(bounds: &Bounds) -> Result<Url> {
    Url::parse_with_params(
        SEARCH_URL,
        &[
            ("format", FORMAT.to_string()),
            ("resolution", RESOLUTION.to_string()),
            ("srid", SRID.to_string()),
            ("state", "current".to_string()),
            ("xMin", bounds.x_min.to_string()),
            ("yMin", bounds.y_min.to_string()),
            ("xMax", bounds.x_max.to_string()),
            ("yMax", bounds.y_max.to_string()),
        ],
    )
    .map_err(|e| Error::RemoteFetch(format!("invalid search URL: {}", e)))
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::RemoteFetch(format!("failed to build HTTP client: {}", e)))
}

/// Asset URLs of the tiles covering `bounds`.
pub fn search_tiles(bounds: &Bounds) -> Result<Vec<String>> {
    let url = search_url(bounds)?;
    debug!("Searching tiles: {}", url);

    let resp = client(SEARCH_TIMEOUT)?
        .get(url)
        .send()
        .map_err(|e| Error::RemoteFetch(format!("tile search failed: {}", e)))?;
    if !resp.status().is_success() {
        return Err(Error::RemoteFetch(format!(
            "tile search failed with status {}",
            resp.status()
        )));
    }

    let body: SearchResponse = resp
        .json()
        .map_err(|e| Error::RemoteFetch(format!("tile search response parse failed: {}", e)))?;
    Ok(body.items.into_iter().map(|i| i.ass_asset_href).collect())
}

fn file_name_of(href: &str) -> Result<String> {
    let url = Url::parse(href)
        .map_err(|e| Error::RemoteFetch(format!("bad asset URL '{}': {}", href, e)))?;
    let name = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    name.ok_or_else(|| Error::RemoteFetch(format!("asset URL without a file name: {}", href)))
}

/// Download every tile covering `bounds` into `dir`. Files already present are kept.
pub fn download_tiles(bounds: &Bounds, dir: &Path) -> Result<Vec<PathBuf>> {
    let hrefs = search_tiles(bounds)?;
    info!("{} tile(s) found for the network footprint", hrefs.len());

    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let http = client(DOWNLOAD_TIMEOUT)?;
    let mut paths = Vec::with_capacity(hrefs.len());
    for href in hrefs {
        let path = dir.join(file_name_of(&href)?);
        if path.is_file() {
            debug!("Tile already downloaded: {:?}", path);
            paths.push(path);
            continue;
        }

        let resp = http
            .get(&href)
            .send()
            .map_err(|e| Error::RemoteFetch(format!("download of {} failed: {}", href, e)))?;
        if !resp.status().is_success() {
            return Err(Error::RemoteFetch(format!(
                "download of {} failed with status {}",
                href,
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .map_err(|e| Error::RemoteFetch(format!("download of {} failed: {}", href, e)))?;
        fs::write(&path, &bytes).map_err(|e| Error::io(&path, e))?;
        info!("Downloaded {:?} ({} bytes)", path, bytes.len());
        paths.push(path);
    }
    Ok(paths)
}
