//! Host-side identity resolution.
//!
//! The host platform supplies two lookups the bridge consumes: which
//! handler owns a given (node, child) pair, and which host thing type a
//! presentation sub-type maps to. Both are plain tables; the bridge never
//! reaches into the host model.

use std::collections::HashMap;

use sensegate_protocol::PresentationType;
use tokio::sync::RwLock;

/// Maps sensor addresses to host handler ids.
#[derive(Default)]
pub struct SensorRegistry {
    handlers: RwLock<HashMap<(u8, u8), String>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a (node, child) pair for a handler. The previous owner, if
    /// any, is returned.
    pub async fn register(
        &self,
        node_id: u8,
        child_id: u8,
        handler_id: impl Into<String>,
    ) -> Option<String> {
        self.handlers
            .write()
            .await
            .insert((node_id, child_id), handler_id.into())
    }

    /// Resolve the handler for an inbound (node, child) pair.
    pub async fn resolve(&self, node_id: u8, child_id: u8) -> Option<String> {
        self.handlers.read().await.get(&(node_id, child_id)).cloned()
    }

    pub async fn unregister(&self, node_id: u8, child_id: u8) -> Option<String> {
        self.handlers.write().await.remove(&(node_id, child_id))
    }
}

/// Host thing type for a presentation sub-type, for discovery inventory
/// entries. Presentation types with no host-side representation (node
/// containers, custom sensors) map to `None`.
pub fn thing_type_for(presentation: PresentationType) -> Option<&'static str> {
    use PresentationType as P;
    let thing_type = match presentation {
        P::Door => "door",
        P::Motion => "motion",
        P::Smoke => "smoke",
        P::Binary => "switch",
        P::Dimmer => "dimmer",
        P::Cover => "cover",
        P::Temperature => "temperature",
        P::Humidity => "humidity",
        P::Barometer => "barometer",
        P::Wind => "wind",
        P::Rain => "rain",
        P::Uv => "uv",
        P::Weight => "weight",
        P::Power => "power",
        P::Heater => "heater",
        P::Distance => "distance",
        P::LightLevel => "light-level",
        P::Lock => "lock",
        P::Ir => "ir",
        P::Water => "water-meter",
        P::AirQuality => "air-quality",
        P::Dust => "dust",
        P::SceneController => "scene-controller",
        P::RgbLight => "rgb-light",
        P::RgbwLight => "rgbw-light",
        P::ColorSensor => "color-sensor",
        P::Hvac => "hvac",
        P::Multimeter => "multimeter",
        P::Sprinkler => "sprinkler",
        P::WaterLeak => "water-leak",
        P::Sound => "sound",
        P::Vibration => "vibration",
        P::Moisture => "moisture",
        P::Info => "info",
        P::Gas => "gas",
        P::Gps => "gps",
        P::WaterQuality => "water-quality",
        P::ArduinoNode | P::ArduinoRepeaterNode | P::Custom | P::Unknown(_) => return None,
    };
    Some(thing_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_resolve() {
        let registry = SensorRegistry::new();
        assert!(registry.resolve(5, 0).await.is_none());

        registry.register(5, 0, "handler-a").await;
        assert_eq!(registry.resolve(5, 0).await.as_deref(), Some("handler-a"));

        let previous = registry.register(5, 0, "handler-b").await;
        assert_eq!(previous.as_deref(), Some("handler-a"));

        registry.unregister(5, 0).await;
        assert!(registry.resolve(5, 0).await.is_none());
    }

    #[test]
    fn node_containers_have_no_thing_type() {
        assert_eq!(thing_type_for(PresentationType::Temperature), Some("temperature"));
        assert!(thing_type_for(PresentationType::ArduinoNode).is_none());
        assert!(thing_type_for(PresentationType::Unknown(99)).is_none());
    }
}
