//! Map layer preferences.
//!
//! `MapLayerPreferences` is always fully defaulted: every constructor and
//! every decode path goes through [`MapLayerPreferences::sanitize`], so
//! structural equality is a reliable no-op check for the sync engine.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_HAZARD_OPACITY: u8 = 80;
pub const DEFAULT_WEATHER_OPACITY: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaseMap {
    #[default]
    Standard,
    Satellite,
}

impl BaseMap {
    /// Lenient parse used when reading local or remote snapshots.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "satellite" => Some(Self::Satellite),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Satellite => "satellite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overlay {
    Hazard,
    Traffic,
    Weather,
}

impl Overlay {
    pub const ALL: [Self; 3] = [Self::Hazard, Self::Traffic, Self::Weather];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hazard => "hazard",
            Self::Traffic => "traffic",
            Self::Weather => "weather",
        }
    }

    const fn long_name(self) -> &'static str {
        match self {
            Self::Hazard => "hazardOverlay",
            Self::Traffic => "trafficOverlay",
            Self::Weather => "weatherOverlay",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|o| s.eq_ignore_ascii_case(o.as_str()) || s.eq_ignore_ascii_case(o.long_name()))
    }

    #[must_use]
    pub const fn default_enabled(self) -> bool {
        matches!(self, Self::Hazard)
    }

    /// Traffic is drawn by the tile provider and has no opacity control.
    #[must_use]
    pub const fn default_opacity(self) -> Option<Percent> {
        match self {
            Self::Hazard => Some(Percent(DEFAULT_HAZARD_OPACITY)),
            Self::Weather => Some(Percent(DEFAULT_WEATHER_OPACITY)),
            Self::Traffic => None,
        }
    }

    fn lookup(self, obj: &Map<String, Value>) -> Option<&Value> {
        obj.get(self.as_str()).or_else(|| obj.get(self.long_name()))
    }
}

impl std::fmt::Display for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer percentage, clamped to `0..=100` on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Percent(u8);

impl Percent {
    pub const MAX: u8 = 100;

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(value: i64) -> Self {
        Self(value.clamp(0, i64::from(Self::MAX)) as u8)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Self(value.round().clamp(0.0, f64::from(Self::MAX)) as u8))
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::new).or_else(|| n.as_f64().and_then(Self::from_f64)),
            Value::String(s) => s.trim().parse::<f64>().ok().and_then(Self::from_f64),
            _ => None,
        }
    }
}

impl From<u8> for Percent {
    fn from(value: u8) -> Self {
        Self::new(i64::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OverlayToggles {
    pub hazard: bool,
    pub traffic: bool,
    pub weather: bool,
}

impl Default for OverlayToggles {
    fn default() -> Self {
        Self {
            hazard: Overlay::Hazard.default_enabled(),
            traffic: Overlay::Traffic.default_enabled(),
            weather: Overlay::Weather.default_enabled(),
        }
    }
}

impl OverlayToggles {
    #[must_use]
    pub const fn get(&self, overlay: Overlay) -> bool {
        match overlay {
            Overlay::Hazard => self.hazard,
            Overlay::Traffic => self.traffic,
            Overlay::Weather => self.weather,
        }
    }

    pub fn set(&mut self, overlay: Overlay, enabled: bool) {
        match overlay {
            Overlay::Hazard => self.hazard = enabled,
            Overlay::Traffic => self.traffic = enabled,
            Overlay::Weather => self.weather = enabled,
        }
    }

    /// Accepts either a map of toggles or a list of enabled overlay names.
    fn sanitize(value: Option<&Value>) -> Self {
        let mut toggles = Self::default();
        match value {
            Some(Value::Object(obj)) => {
                for overlay in Overlay::ALL {
                    if let Some(on) = overlay.lookup(obj).and_then(Value::as_bool) {
                        toggles.set(overlay, on);
                    }
                }
            }
            Some(Value::Array(items)) => {
                for overlay in Overlay::ALL {
                    let listed = items
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|name| Overlay::parse(name) == Some(overlay));
                    toggles.set(overlay, listed);
                }
            }
            _ => {}
        }
        toggles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OverlayOpacity {
    pub hazard: Percent,
    pub weather: Percent,
}

impl Default for OverlayOpacity {
    fn default() -> Self {
        Self {
            hazard: Percent(DEFAULT_HAZARD_OPACITY),
            weather: Percent(DEFAULT_WEATHER_OPACITY),
        }
    }
}

impl OverlayOpacity {
    #[must_use]
    pub const fn get(&self, overlay: Overlay) -> Option<Percent> {
        match overlay {
            Overlay::Hazard => Some(self.hazard),
            Overlay::Weather => Some(self.weather),
            Overlay::Traffic => None,
        }
    }

    /// Returns `false` for overlays without an opacity control.
    pub fn set(&mut self, overlay: Overlay, value: Percent) -> bool {
        match overlay {
            Overlay::Hazard => self.hazard = value,
            Overlay::Weather => self.weather = value,
            Overlay::Traffic => return false,
        }
        true
    }

    fn sanitize(value: Option<&Value>) -> Self {
        let mut opacity = Self::default();
        if let Some(Value::Object(obj)) = value {
            for overlay in Overlay::ALL {
                if let Some(pct) = overlay.lookup(obj).and_then(Percent::from_json) {
                    opacity.set(overlay, pct);
                }
            }
        }
        opacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MapLayerPreferences {
    pub base_map: BaseMap,
    pub overlays: OverlayToggles,
    pub opacity: OverlayOpacity,
}

impl MapLayerPreferences {
    /// Coerces arbitrary input into valid preferences. Unknown fields are
    /// dropped, missing or malformed fields fall back to defaults and
    /// out-of-range opacities are clamped. Never fails.
    #[must_use]
    pub fn sanitize(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let base_map = obj
            .get("baseMap")
            .or_else(|| obj.get("base_map"))
            .and_then(Value::as_str)
            .and_then(BaseMap::parse)
            .unwrap_or_default();

        Self {
            base_map,
            overlays: OverlayToggles::sanitize(obj.get("overlays")),
            opacity: OverlayOpacity::sanitize(obj.get("opacity")),
        }
    }

    /// Top-level fields are replaced, `overlays` and `opacity` are merged
    /// key by key so a patch touching one overlay leaves the others alone.
    #[must_use]
    pub fn merged(&self, patch: &PreferencesPatch) -> Self {
        let mut next = *self;
        if let Some(base_map) = patch.base_map {
            next.base_map = base_map;
        }
        for overlay in Overlay::ALL {
            if let Some(enabled) = patch.overlays.get(overlay) {
                next.overlays.set(overlay, enabled);
            }
            if let Some(pct) = patch.opacity.get(overlay) {
                next.opacity.set(overlay, pct);
            }
        }
        next
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "baseMap": self.base_map.as_str(),
            "overlays": {
                "hazard": self.overlays.hazard,
                "traffic": self.overlays.traffic,
                "weather": self.overlays.weather,
            },
            "opacity": {
                "hazard": self.opacity.hazard.value(),
                "weather": self.opacity.weather.value(),
            },
        })
    }
}

impl<'de> Deserialize<'de> for MapLayerPreferences {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::sanitize(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayPatch {
    pub hazard: Option<bool>,
    pub traffic: Option<bool>,
    pub weather: Option<bool>,
}

impl OverlayPatch {
    #[must_use]
    pub const fn get(&self, overlay: Overlay) -> Option<bool> {
        match overlay {
            Overlay::Hazard => self.hazard,
            Overlay::Traffic => self.traffic,
            Overlay::Weather => self.weather,
        }
    }

    fn set(&mut self, overlay: Overlay, enabled: bool) {
        let slot = match overlay {
            Overlay::Hazard => &mut self.hazard,
            Overlay::Traffic => &mut self.traffic,
            Overlay::Weather => &mut self.weather,
        };
        *slot = Some(enabled);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpacityPatch {
    pub hazard: Option<Percent>,
    pub weather: Option<Percent>,
}

impl OpacityPatch {
    #[must_use]
    pub const fn get(&self, overlay: Overlay) -> Option<Percent> {
        match overlay {
            Overlay::Hazard => self.hazard,
            Overlay::Weather => self.weather,
            Overlay::Traffic => None,
        }
    }

    fn set(&mut self, overlay: Overlay, value: Percent) {
        match overlay {
            Overlay::Hazard => self.hazard = Some(value),
            Overlay::Weather => self.weather = Some(value),
            Overlay::Traffic => {}
        }
    }
}

/// Partial update applied through [`MapLayerPreferences::merged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreferencesPatch {
    pub base_map: Option<BaseMap>,
    pub overlays: OverlayPatch,
    pub opacity: OpacityPatch,
}

impl PreferencesPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn base_map(mut self, base_map: BaseMap) -> Self {
        self.base_map = Some(base_map);
        self
    }

    #[must_use]
    pub fn overlay(mut self, overlay: Overlay, enabled: bool) -> Self {
        self.overlays.set(overlay, enabled);
        self
    }

    #[must_use]
    pub fn opacity(mut self, overlay: Overlay, value: impl Into<Percent>) -> Self {
        self.opacity.set(overlay, value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Builds a patch from a UI payload, keeping only the fields that are
    /// present and valid.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut patch = Self::default();
        let Some(obj) = value.as_object() else {
            return patch;
        };

        patch.base_map = obj
            .get("baseMap")
            .or_else(|| obj.get("base_map"))
            .and_then(Value::as_str)
            .and_then(BaseMap::parse);

        if let Some(Value::Object(overlays)) = obj.get("overlays") {
            for overlay in Overlay::ALL {
                if let Some(enabled) = overlay.lookup(overlays).and_then(Value::as_bool) {
                    patch.overlays.set(overlay, enabled);
                }
            }
        }

        if let Some(Value::Object(opacity)) = obj.get("opacity") {
            for overlay in Overlay::ALL {
                if let Some(pct) = overlay.lookup(opacity).and_then(Percent::from_json) {
                    patch.opacity.set(overlay, pct);
                }
            }
        }

        patch
    }
}
