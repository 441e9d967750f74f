//! Heatmap intensity quantization and per-domain hues

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Color of an empty cell
pub const EMPTY_CELL_COLOR: &str = "#ebedf0";

/// Hue used when a stored color cannot be parsed
pub const FALLBACK_HUE: u16 = 140;

/// Cell intensity level (GitHub-contributions style)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Empty,
    Low,
    Medium,
    High,
    Max,
}

impl Intensity {
    /// Quantize `count / max_count` into four bins at 0.25 / 0.50 / 0.75 / 1.00
    pub fn from_counts(count: u32, max_count: u32) -> Self {
        if count == 0 {
            return Self::Empty;
        }
        let ratio = count as f64 / max_count.max(1) as f64;
        if ratio <= 0.25 {
            Self::Low
        } else if ratio <= 0.50 {
            Self::Medium
        } else if ratio <= 0.75 {
            Self::High
        } else {
            Self::Max
        }
    }

    /// `(saturation%, lightness%)` of the level, `None` for empty cells
    pub fn saturation_lightness(self) -> Option<(u8, u8)> {
        match self {
            Self::Empty => None,
            Self::Low => Some((42, 86)),
            Self::Medium => Some((50, 76)),
            Self::High => Some((54, 66)),
            Self::Max => Some((58, 60)),
        }
    }
}

/// Extract the hue of an `hsl(H, S%, L%)` string
pub fn parse_hue(base_color: &str) -> Option<u16> {
    let inner = base_color
        .trim()
        .strip_prefix("hsl(")?
        .strip_suffix(')')?;
    let hue = inner.split(',').next()?.trim();
    let hue: f64 = hue.trim_end_matches("deg").parse().ok()?;
    if !hue.is_finite() {
        return None;
    }
    Some(hue.rem_euclid(360.0).round() as u16 % 360)
}

/// Color of a cell with `count` visits in a row whose maximum is `max_count`
pub fn color_for(count: u32, max_count: u32, base_color: &str) -> String {
    match Intensity::from_counts(count, max_count).saturation_lightness() {
        None => EMPTY_CELL_COLOR.to_string(),
        Some((saturation, lightness)) => {
            let hue = parse_hue(base_color).unwrap_or(FALLBACK_HUE);
            format!("hsl({}, {}%, {}%)", hue, saturation, lightness)
        }
    }
}

/// Deterministic base color of a domain
pub fn domain_base_color(domain: &str) -> String {
    let digest = Sha256::digest(domain.as_bytes());
    let hue = u16::from_be_bytes([digest[0], digest[1]]) % 360;
    let saturation = 55 + digest[2] % 20;
    let lightness = 45 + digest[3] % 10;
    format!("hsl({}, {}%, {}%)", hue, saturation, lightness)
}

/// Domain → base color, assigned once and never regenerated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainColors {
    colors: BTreeMap<String, String>,
}

impl DomainColors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Color for `domain`, assigning one on first encounter
    ///
    /// Returns whether a new color was assigned.
    pub fn ensure(&mut self, domain: &str) -> bool {
        if self.colors.contains_key(domain) {
            return false;
        }
        self.colors.insert(domain.to_string(), domain_base_color(domain));
        true
    }

    pub fn get(&self, domain: &str) -> Option<&str> {
        self.colors.get(domain).map(String::as_str)
    }

    /// Stored color, or the deterministic one when none was assigned yet
    pub fn color_of(&self, domain: &str) -> String {
        match self.get(domain) {
            Some(color) => color.to_string(),
            None => domain_base_color(domain),
        }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_count_is_neutral_gray() {
        assert_eq!(color_for(0, 10, "hsl(200, 60%, 50%)"), "#ebedf0");
        assert_eq!(color_for(0, 0, "garbage"), "#ebedf0");
    }

    #[test]
    fn test_max_count_is_darkest_bin() {
        assert_eq!(color_for(10, 10, "hsl(200, 60%, 50%)"), "hsl(200, 58%, 60%)");
        assert_eq!(Intensity::from_counts(7, 7), Intensity::Max);
    }

    #[test]
    fn test_bin_boundaries() {
        assert_eq!(Intensity::from_counts(1, 4), Intensity::Low);
        assert_eq!(Intensity::from_counts(2, 4), Intensity::Medium);
        assert_eq!(Intensity::from_counts(3, 4), Intensity::High);
        assert_eq!(Intensity::from_counts(4, 4), Intensity::Max);
        // max_count of zero is treated as one
        assert_eq!(Intensity::from_counts(3, 0), Intensity::Max);
    }

    #[test]
    fn test_saturation_monotonic_in_count() {
        let max = 37;
        let mut previous = 0u8;
        for count in 0..=max {
            let saturation = Intensity::from_counts(count, max)
                .saturation_lightness()
                .map(|(s, _)| s)
                .unwrap_or(0);
            assert!(saturation >= previous, "count {}", count);
            previous = saturation;
        }
    }

    #[test]
    fn test_malformed_base_color_falls_back_to_green() {
        assert_eq!(color_for(1, 1, "rgb(1,2,3)"), "hsl(140, 58%, 60%)");
        assert_eq!(color_for(1, 1, "hsl(abc, 1%, 1%)"), "hsl(140, 58%, 60%)");
        assert_eq!(parse_hue(" hsl(725, 50%, 50%) "), Some(5));
        assert_eq!(parse_hue("hsl(33.6deg, 50%, 50%)"), Some(34));
    }

    #[test]
    fn test_domain_colors_are_stable() {
        let mut colors = DomainColors::new();
        assert!(colors.ensure("example.com"));
        assert!(!colors.ensure("example.com"));
        assert_eq!(colors.get("example.com").unwrap(), domain_base_color("example.com"));
        assert!(parse_hue(&colors.color_of("other.org")).is_some());
    }

    #[test]
    fn test_stored_colors_are_not_regenerated() {
        let mut colors: DomainColors =
            serde_json::from_str(r#"{"legacy.com": "not-a-color"}"#).unwrap();
        assert!(!colors.ensure("legacy.com"));
        assert_eq!(colors.get("legacy.com"), Some("not-a-color"));
        assert_eq!(colors.len(), 1);
    }
}
