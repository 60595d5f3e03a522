//! Logical naming of a merged DEM mosaic.
//!
//! swissALTI3D tiles are named `<dataset>_<year>_<xkm>-<ykm>_<res>_<projxy>_<projz>`,
//! e.g. `swissalti3d_2019_2600-1200_0.5_2056_5728`. The merged tile is named
//! after the south-west-most kilometre index of its components.

use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct TileName {
    pub dataset: String,
    pub year: u32,
    pub x_km: i64,
    pub y_km: i64,
    pub resolution: String,
    pub proj_xy: u32,
    pub proj_z: u32,
}

impl TileName {
    /// ファイル名のstemを解析する。命名規則に合わない場合は`None`
    pub fn parse(stem: &str) -> Option<Self> {
        let tokens: Vec<&str> = stem.split('_').collect();

        // dataset部分は'_'を含み得るので、後続トークンが揃う最初の位置を探す
        for start in 1..tokens.len() {
            if tokens.len() < start + 5 {
                break;
            }
            let dataset = tokens[..start].join("_");
            if !is_word(&dataset) {
                continue;
            }
            if let Some(name) = parse_tail(&dataset, &tokens[start..start + 5]) {
                return Some(name);
            }
        }
        None
    }

    pub fn to_stem(&self) -> String {
        format!(
            "{}_{}_{}-{}_{}_{}_{}",
            self.dataset,
            self.year,
            self.x_km,
            self.y_km,
            self.resolution,
            self.proj_xy,
            self.proj_z
        )
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn leading_digits(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn parse_tail(dataset: &str, tokens: &[&str]) -> Option<TileName> {
    let year: u32 = tokens[0].parse().ok()?;
    let (x, y) = tokens[1].split_once('-')?;
    let x_km: i64 = x.parse().ok()?;
    let y_km: i64 = y.parse().ok()?;
    let resolution = tokens[2];
    if resolution.is_empty() || !resolution.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let proj_xy: u32 = tokens[3].parse().ok()?;
    // 最後のトークンは数字で始まれば良い（後続の接尾辞は無視）
    let proj_z = leading_digits(tokens[4])?;

    Some(TileName {
        dataset: dataset.to_string(),
        year,
        x_km,
        y_km,
        resolution: resolution.to_string(),
        proj_xy,
        proj_z,
    })
}

fn file_stem(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("")
}

/// Build the logical filename of the mosaic built from `paths`.
///
/// Tiles that do not follow the naming convention are excluded from the name
/// (they are still merged) and reported with a warning each. Returns `None`
/// only when `paths` is empty.
pub fn merged_tile_name(paths: &[PathBuf]) -> Option<PathBuf> {
    let last = paths.last()?;
    let parent = last.parent().map(Path::to_path_buf).unwrap_or_default();
    let extension = last
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let mut template: Option<TileName> = None;
    let mut x_min = i64::MAX;
    let mut y_min = i64::MAX;

    for path in paths {
        match TileName::parse(file_stem(path)) {
            Some(name) => {
                x_min = x_min.min(name.x_km);
                y_min = y_min.min(name.y_km);
                if template.is_none() {
                    template = Some(name);
                }
            }
            None => {
                warn!(
                    "Tile {:?} does not match the expected naming convention; it is merged but excluded from the mosaic name",
                    path
                );
            }
        }
    }

    let stem = match template {
        Some(mut name) => {
            name.x_km = x_min;
            name.y_km = y_min;
            name.to_stem()
        }
        None => file_stem(&paths[0]).to_string(),
    };

    Some(parent.join(format!("{}_extended{}", stem, extension)))
}
