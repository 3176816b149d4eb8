use geo::{coord, Coord, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object class of a top-level city object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Building,
    BuildingPart,
    Bridge,
    Tunnel,
    Road,
    Railway,
    WaterBody,
    Relief,
    Vegetation,
    CityFurniture,
    LandUse,
    Appearance,
    Group,
    Generic,
}

impl TypeTag {
    pub const ALL: [TypeTag; 14] = [
        TypeTag::Building,
        TypeTag::BuildingPart,
        TypeTag::Bridge,
        TypeTag::Tunnel,
        TypeTag::Road,
        TypeTag::Railway,
        TypeTag::WaterBody,
        TypeTag::Relief,
        TypeTag::Vegetation,
        TypeTag::CityFurniture,
        TypeTag::LandUse,
        TypeTag::Appearance,
        TypeTag::Group,
        TypeTag::Generic,
    ];

    /// Stable numeric code stored in database rows.
    pub const fn code(self) -> i64 {
        match self {
            TypeTag::Building => 26,
            TypeTag::BuildingPart => 25,
            TypeTag::Bridge => 64,
            TypeTag::Tunnel => 85,
            TypeTag::Road => 45,
            TypeTag::Railway => 46,
            TypeTag::WaterBody => 9,
            TypeTag::Relief => 14,
            TypeTag::Vegetation => 7,
            TypeTag::CityFurniture => 21,
            TypeTag::LandUse => 4,
            TypeTag::Appearance => 50,
            TypeTag::Group => 23,
            TypeTag::Generic => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::Building => "Building",
            TypeTag::BuildingPart => "BuildingPart",
            TypeTag::Bridge => "Bridge",
            TypeTag::Tunnel => "Tunnel",
            TypeTag::Road => "Road",
            TypeTag::Railway => "Railway",
            TypeTag::WaterBody => "WaterBody",
            TypeTag::Relief => "ReliefFeature",
            TypeTag::Vegetation => "SolitaryVegetationObject",
            TypeTag::CityFurniture => "CityFurniture",
            TypeTag::LandUse => "LandUse",
            TypeTag::Appearance => "Appearance",
            TypeTag::Group => "CityObjectGroup",
            TypeTag::Generic => "GenericCityObject",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TypeTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s) || format!("{t:?}").eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown object type: {s}"))
    }
}

/// Axis-aligned bounding envelope in a given spatial reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub rect: Rect<f64>,
    pub srid: u32,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, srid: u32) -> Self {
        Self {
            rect: Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y }),
            srid,
        }
    }

    pub fn midpoint(&self) -> Coord<f64> {
        self.rect.center()
    }

    /// `[min_x, min_y, max_x, max_y]`
    pub fn bounds(&self) -> [f64; 4] {
        let min = self.rect.min();
        let max = self.rect.max();
        [min.x, min.y, max.x, max.y]
    }
}

/// One top-level source object scheduled for transformation.
///
/// `payload` is whatever the source hands over for later materialization; the
/// envelope is available without touching it so the tiling filter stays cheap.
#[derive(Debug, Clone)]
pub struct WorkUnit<P> {
    pub external_id: String,
    pub type_tag: TypeTag,
    pub envelope: Option<Envelope>,
    pub sequence: u64,
    pub payload: P,
}

impl<P> WorkUnit<P> {
    /// Short description used in logs and abort events.
    pub fn describe(&self) -> String {
        format!("{} '{}' (#{})", self.type_tag, self.external_id, self.sequence)
    }
}

/// Identifier cache record for one external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub external_id: String,
    pub internal_id: i64,
    pub root_id: i64,
    pub reverse: bool,
    pub mapping: Option<String>,
    pub type_tag: TypeTag,
}

impl CacheEntry {
    pub fn new(external_id: impl Into<String>, internal_id: i64, type_tag: TypeTag) -> Self {
        Self {
            external_id: external_id.into(),
            internal_id,
            root_id: internal_id,
            reverse: false,
            mapping: None,
            type_tag,
        }
    }

    pub fn with_root(mut self, root_id: i64) -> Self {
        self.root_id = root_id;
        self
    }
}

/// What a worker produced for one sequence number.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Finished(T),
    /// Stands in for a unit with no output so the sink can keep advancing.
    Tombstone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for tag in TypeTag::ALL {
            assert_eq!(TypeTag::from_code(tag.code()), Some(tag));
        }
        assert_eq!(TypeTag::from_code(-1), None);
    }

    #[test]
    fn type_tag_parses_element_and_variant_names() {
        assert_eq!("Building".parse::<TypeTag>(), Ok(TypeTag::Building));
        assert_eq!("CityObjectGroup".parse::<TypeTag>(), Ok(TypeTag::Group));
        assert_eq!("group".parse::<TypeTag>(), Ok(TypeTag::Group));
        assert!("Spaceship".parse::<TypeTag>().is_err());
    }

    #[test]
    fn envelope_midpoint() {
        let env = Envelope::new(0.0, 0.0, 10.0, 4.0, 3857);
        assert_eq!(env.midpoint(), coord! { x: 5.0, y: 2.0 });
        assert_eq!(env.bounds(), [0.0, 0.0, 10.0, 4.0]);
    }

    #[test]
    fn envelope_normalizes_corners() {
        let env = Envelope::new(10.0, 4.0, 0.0, 0.0, 4326);
        assert_eq!(env.bounds(), [0.0, 0.0, 10.0, 4.0]);
    }

    #[test]
    fn describe_names_the_unit() {
        let unit = WorkUnit {
            external_id: "gml-42".to_string(),
            type_tag: TypeTag::Bridge,
            envelope: None,
            sequence: 7,
            payload: (),
        };
        assert_eq!(unit.describe(), "Bridge 'gml-42' (#7)");
    }
}
