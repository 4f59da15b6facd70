//! Geo index answering near and within queries.

use super::{split_paths, unsupported, Index, IndexDefinition, IndexKind, IndexLookup};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::handle::HandleId;
use crate::types::IndexId;
use serde_json::Value;
use std::collections::HashMap;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
#[must_use]
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Point index. Documents without a valid coordinate are not indexed.
#[derive(Debug)]
pub struct GeoIndex {
    definition: IndexDefinition,
    paths: Vec<Vec<String>>,
    points: HashMap<HandleId, (f64, f64)>,
}

impl GeoIndex {
    /// Creates an empty geo index.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the field count does not fit the kind.
    pub fn new(definition: &IndexDefinition) -> CoreResult<Self> {
        let expected = match definition.kind {
            IndexKind::Geo1 => 1,
            IndexKind::Geo2 => 2,
            other => {
                return Err(CoreError::bad_parameter(format!(
                    "{} is not a geo index",
                    other.as_str()
                )))
            }
        };
        if definition.fields.len() != expected {
            return Err(CoreError::bad_parameter(format!(
                "{} index needs {expected} field(s)",
                definition.kind.as_str()
            )));
        }
        Ok(Self {
            definition: definition.clone(),
            paths: split_paths(&definition.fields),
            points: HashMap::new(),
        })
    }

    fn coordinate(&self, doc: &Document) -> Option<(f64, f64)> {
        let (lat, lon) = match self.definition.kind {
            IndexKind::Geo1 => {
                let pair = doc.get_path(&self.paths[0])?.as_array()?;
                if pair.len() != 2 {
                    return None;
                }
                let (a, b) = (pair[0].as_f64()?, pair[1].as_f64()?);
                if self.definition.geo_json.unwrap_or(false) {
                    (b, a)
                } else {
                    (a, b)
                }
            }
            _ => (
                doc.get_path(&self.paths[0]).and_then(Value::as_f64)?,
                doc.get_path(&self.paths[1]).and_then(Value::as_f64)?,
            ),
        };
        ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
    }

    fn by_distance(&self, latitude: f64, longitude: f64) -> Vec<(f64, HandleId)> {
        let mut ranked: Vec<(f64, HandleId)> = self
            .points
            .iter()
            .map(|(handle, (lat, lon))| (haversine(latitude, longitude, *lat, *lon), *handle))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked
    }
}

impl Index for GeoIndex {
    fn id(&self) -> IndexId {
        self.definition.id
    }

    fn kind(&self) -> IndexKind {
        self.definition.kind
    }

    fn fields(&self) -> &[String] {
        &self.definition.fields
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn insert(&mut self, handle: HandleId, doc: &Document, _is_rollback: bool) -> CoreResult<()> {
        if let Some(point) = self.coordinate(doc) {
            self.points.try_reserve(1)?;
            self.points.insert(handle, point);
        }
        Ok(())
    }

    fn remove(&mut self, handle: HandleId, doc: &Document, is_rollback: bool) -> CoreResult<()> {
        if self.coordinate(doc).is_none() {
            return Ok(());
        }
        if self.points.remove(&handle).is_none() && !is_rollback {
            return Err(CoreError::not_found(doc.key().unwrap_or_default()));
        }
        Ok(())
    }

    fn lookup(&self, query: &IndexLookup) -> CoreResult<Vec<HandleId>> {
        match query {
            IndexLookup::Near {
                latitude,
                longitude,
                limit,
            } => Ok(self
                .by_distance(*latitude, *longitude)
                .into_iter()
                .take(*limit)
                .map(|(_, h)| h)
                .collect()),
            IndexLookup::Within {
                latitude,
                longitude,
                radius,
            } => Ok(self
                .by_distance(*latitude, *longitude)
                .into_iter()
                .take_while(|(d, _)| d <= radius)
                .map(|(_, h)| h)
                .collect()),
            other => Err(unsupported(self.definition.kind, other)),
        }
    }

    fn size_hint(&mut self, documents: usize) {
        let _ = self.points.try_reserve(documents);
    }

    fn memory_usage(&self) -> usize {
        self.points.capacity() * std::mem::size_of::<(HandleId, (f64, f64))>()
    }

    fn len(&self) -> usize {
        self.points.len()
    }

    fn definition(&self) -> IndexDefinition {
        self.definition.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body: Value) -> Document {
        Document::from_value(body).unwrap()
    }

    #[test]
    fn haversine_known_distance() {
        // Paris to London is roughly 344 km.
        let d = haversine(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 343_500.0).abs() < 2_000.0, "{d}");
        assert!(haversine(10.0, 10.0, 10.0, 10.0).abs() < 1e-6);
    }

    #[test]
    fn near_and_within_geo2() {
        let mut index = GeoIndex::new(&IndexDefinition::geo(&["lat", "lon"], false)).unwrap();
        index
            .insert(HandleId(0), &doc(json!({"_key": "a", "lat": 0.0, "lon": 0.0})), false)
            .unwrap();
        index
            .insert(HandleId(1), &doc(json!({"_key": "b", "lat": 0.0, "lon": 1.0})), false)
            .unwrap();
        index
            .insert(HandleId(2), &doc(json!({"_key": "c", "lat": 0.0, "lon": 5.0})), false)
            .unwrap();
        index
            .insert(HandleId(3), &doc(json!({"_key": "d", "lat": 95.0, "lon": 0.0})), false)
            .unwrap();
        assert_eq!(index.len(), 3);

        let near = index
            .lookup(&IndexLookup::Near { latitude: 0.0, longitude: 0.9, limit: 2 })
            .unwrap();
        assert_eq!(near, vec![HandleId(1), HandleId(0)]);

        let within = index
            .lookup(&IndexLookup::Within { latitude: 0.0, longitude: 0.0, radius: 200_000.0 })
            .unwrap();
        assert_eq!(within, vec![HandleId(0), HandleId(1)]);
    }

    #[test]
    fn geo_json_order() {
        let mut index = GeoIndex::new(&IndexDefinition::geo(&["loc"], true)).unwrap();
        index
            .insert(HandleId(0), &doc(json!({"_key": "a", "loc": [100.0, 10.0]})), false)
            .unwrap();
        let near = index
            .lookup(&IndexLookup::Near { latitude: 10.0, longitude: 100.0, limit: 1 })
            .unwrap();
        assert_eq!(near, vec![HandleId(0)]);
        assert!(index.is_sparse());
    }

    #[test]
    fn wrong_field_count() {
        let mut def = IndexDefinition::geo(&["a"], false);
        def.fields.push("b".into());
        assert!(GeoIndex::new(&def).is_err());
    }
}
