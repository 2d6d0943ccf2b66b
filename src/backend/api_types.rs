//! Serde types matching backend rows, and the mapping to domain types.
//!
//! Rows use the backend's column names and may carry numeric columns as
//! strings. Conversion into `Property` parses those, validates the record
//! and derives the display strings; conversion back produces a row that can
//! be written as-is.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use super::types::{
  format_area, format_price, Agent, ListingCategory, Property, PropertyDetails, PropertyStatus,
};
use crate::error::SyncError;

// ============================================================================
// Lenient numeric columns
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
  Number(f64),
  Text(String),
}

impl NumberOrString {
  fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
    match self {
      NumberOrString::Number(n) => Ok(n),
      NumberOrString::Text(s) => {
        let trimmed = s.trim();
        if trimmed.is_empty() {
          return Ok(0.0);
        }
        trimmed
          .parse::<f64>()
          .map_err(|_| E::custom(format!("expected a number, got '{}'", s)))
      }
    }
  }
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
  NumberOrString::deserialize(deserializer)?.into_f64()
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
  Option::<NumberOrString>::deserialize(deserializer)?
    .map(|v| v.into_f64::<D::Error>())
    .transpose()
}

fn de_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
  let value: Option<NumberOrString> = Option::deserialize(deserializer)?;
  match value {
    Some(v) => Ok(v.into_f64::<D::Error>()?.max(0.0) as u32),
    None => Ok(0),
  }
}

fn de_opt_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
  Ok(de_opt_f64(deserializer)?.map(|n| n.max(0.0) as u32))
}

fn de_big_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
  Ok(de_opt_f64(deserializer)?.map(|n| n.max(0.0) as u64).unwrap_or(0))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiAgent {
  #[serde(rename = "nombre")]
  pub name: String,
  #[serde(rename = "especialidad", default)]
  pub specialty: Option<String>,
  #[serde(rename = "calificacion", default, deserialize_with = "de_opt_f64")]
  pub rating: Option<f64>,
  #[serde(rename = "ventas", default, deserialize_with = "de_opt_count")]
  pub deals: Option<u32>,
  #[serde(rename = "telefono", default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiDetails {
  #[serde(rename = "subtipo", default)]
  pub subtype: Option<String>,
  #[serde(rename = "area_lote", default, deserialize_with = "de_opt_f64")]
  pub lot_area: Option<f64>,
  #[serde(rename = "antiguedad", default, deserialize_with = "de_opt_count")]
  pub age_years: Option<u32>,
  #[serde(rename = "vistas", default, deserialize_with = "de_big_count")]
  pub views: u64,
  #[serde(rename = "favoritos", default, deserialize_with = "de_big_count")]
  pub favorites: u64,
  #[serde(rename = "fecha_publicacion_texto", default)]
  pub published_display: Option<String>,
}

/// One row of the listings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRow {
  pub id: i64,
  #[serde(rename = "titulo", default)]
  pub title: String,
  #[serde(rename = "ubicacion", default)]
  pub location: String,
  #[serde(rename = "precio", deserialize_with = "de_f64")]
  pub price: f64,
  #[serde(rename = "tipo", default)]
  pub property_type: String,
  #[serde(rename = "habitaciones", default, deserialize_with = "de_count")]
  pub bedrooms: u32,
  #[serde(rename = "banos", default, deserialize_with = "de_count")]
  pub bathrooms: u32,
  #[serde(default, deserialize_with = "de_f64")]
  pub area: f64,
  #[serde(rename = "imagen", default)]
  pub image: String,
  #[serde(rename = "descripcion", default)]
  pub description: String,
  #[serde(rename = "caracteristicas", default)]
  pub features: Vec<String>,
  #[serde(rename = "estado")]
  pub status: PropertyStatus,
  #[serde(rename = "categoria")]
  pub category: ListingCategory,
  #[serde(rename = "fecha_publicacion", default)]
  pub published_at: Option<NaiveDate>,
  #[serde(rename = "tour_virtual", default)]
  pub virtual_tour: Option<String>,
  #[serde(rename = "galeria", default)]
  pub gallery: Option<Vec<String>>,
  #[serde(rename = "agente", default)]
  pub agent: Option<ApiAgent>,
  #[serde(rename = "detalles", default)]
  pub details: Option<ApiDetails>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<String>,
}

impl PropertyRow {
  /// Parse a raw JSON row.
  pub fn from_json(value: serde_json::Value) -> Result<Self, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Decode(format!("property row: {}", e)))
  }

  /// JSON body for an update: every column except the keys the backend owns.
  pub fn to_patch(&self) -> Result<serde_json::Value, SyncError> {
    let mut value = serde_json::to_value(self)?;
    if let Some(obj) = value.as_object_mut() {
      obj.remove("id");
      obj.remove("created_at");
    }
    Ok(value)
  }
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl From<ApiAgent> for Agent {
  fn from(a: ApiAgent) -> Self {
    Agent {
      name: a.name,
      specialty: a.specialty,
      rating: a.rating,
      deals: a.deals,
      phone: a.phone,
      email: a.email,
    }
  }
}

impl From<&Agent> for ApiAgent {
  fn from(a: &Agent) -> Self {
    ApiAgent {
      name: a.name.clone(),
      specialty: a.specialty.clone(),
      rating: a.rating,
      deals: a.deals,
      phone: a.phone.clone(),
      email: a.email.clone(),
    }
  }
}

impl From<ApiDetails> for PropertyDetails {
  fn from(d: ApiDetails) -> Self {
    PropertyDetails {
      subtype: d.subtype,
      lot_area: d.lot_area,
      age_years: d.age_years,
      views: d.views,
      favorites: d.favorites,
      published_display: d.published_display,
    }
  }
}

impl From<&PropertyDetails> for ApiDetails {
  fn from(d: &PropertyDetails) -> Self {
    ApiDetails {
      subtype: d.subtype.clone(),
      lot_area: d.lot_area,
      age_years: d.age_years,
      views: d.views,
      favorites: d.favorites,
      published_display: d.published_display.clone(),
    }
  }
}

impl TryFrom<PropertyRow> for Property {
  type Error = SyncError;

  fn try_from(row: PropertyRow) -> Result<Self, Self::Error> {
    if row.id <= 0 {
      return Err(SyncError::Decode(format!("property id must be positive, got {}", row.id)));
    }
    if row.title.trim().is_empty() {
      return Err(SyncError::Decode(format!("property {} has no title", row.id)));
    }
    if row.price < 0.0 || row.area < 0.0 {
      return Err(SyncError::Decode(format!(
        "property {} has a negative price or area",
        row.id
      )));
    }

    Ok(Property {
      id: row.id,
      price_display: format_price(row.price),
      area_display: format_area(row.area),
      title: row.title,
      location: row.location,
      price: row.price,
      property_type: row.property_type,
      bedrooms: row.bedrooms,
      bathrooms: row.bathrooms,
      area: row.area,
      image: row.image,
      description: row.description,
      features: row.features,
      status: row.status,
      category: row.category,
      published_at: row.published_at,
      virtual_tour: row.virtual_tour.filter(|t| !t.trim().is_empty()),
      gallery: row.gallery.unwrap_or_default(),
      agent: row.agent.map(Agent::from),
      details: row.details.map(PropertyDetails::from),
    })
  }
}

impl From<&Property> for PropertyRow {
  fn from(p: &Property) -> Self {
    PropertyRow {
      id: p.id,
      title: p.title.clone(),
      location: p.location.clone(),
      price: p.price,
      property_type: p.property_type.clone(),
      bedrooms: p.bedrooms,
      bathrooms: p.bathrooms,
      area: p.area,
      image: p.image.clone(),
      description: p.description.clone(),
      features: p.features.clone(),
      status: p.status,
      category: p.category,
      published_at: p.published_at,
      virtual_tour: p.virtual_tour.clone(),
      gallery: if p.gallery.is_empty() {
        None
      } else {
        Some(p.gallery.clone())
      },
      agent: p.agent.as_ref().map(ApiAgent::from),
      details: p.details.as_ref().map(ApiDetails::from),
      created_at: None,
    }
  }
}

/// Decode a raw row straight into a validated `Property`.
pub fn property_from_json(value: serde_json::Value) -> Result<Property, SyncError> {
  Property::try_from(PropertyRow::from_json(value)?)
}
