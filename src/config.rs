use crate::error::{Error, Result};

/// 三角形分割の許容誤差（m）
pub const DEFAULT_MAX_ERROR: f64 = 0.5;
/// 標高の系統的な補正値（m）
pub const DEFAULT_VERTICAL_OFFSET: f64 = -0.8;
pub const DEFAULT_IDENTIFIER: &str = "NIS_Nummer";
/// CH1903+ / LV95
pub const DEFAULT_EPSG: u32 = 2056;

/// Settings for one footprint run. Passed explicitly to every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_error: f64,
    pub vertical_offset: f64,
    pub line_merge: bool,
    pub identifier: String,
    pub epsg: u32,
    pub write_merged_dem: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_error: DEFAULT_MAX_ERROR,
            vertical_offset: DEFAULT_VERTICAL_OFFSET,
            line_merge: true,
            identifier: DEFAULT_IDENTIFIER.to_string(),
            epsg: DEFAULT_EPSG,
            write_merged_dem: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.max_error.is_finite() || self.max_error < 0.0 {
            return Err(Error::invalid(format!(
                "max_error must be a non-negative number, got {}",
                self.max_error
            )));
        }
        if !self.vertical_offset.is_finite() {
            return Err(Error::invalid(format!(
                "vertical_offset must be finite, got {}",
                self.vertical_offset
            )));
        }
        if self.identifier.trim().is_empty() {
            return Err(Error::invalid("identifier attribute name is empty"));
        }
        Ok(())
    }
}
