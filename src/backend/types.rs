//! Application-side domain types.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::Cacheable;
use crate::error::SyncError;

/// Prefix of an inline-encoded image.
pub const DATA_URL_PREFIX: &str = "data:";

/// Lifecycle status of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
  Available,
  Exclusive,
  Reserved,
}

/// Listing category, used for filtered collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingCategory {
  Sale,
  Rent,
  Special,
  Clearance,
  ExclusivePrivate,
}

impl ListingCategory {
  pub const ALL: [ListingCategory; 5] = [
    ListingCategory::Sale,
    ListingCategory::Rent,
    ListingCategory::Special,
    ListingCategory::Clearance,
    ListingCategory::ExclusivePrivate,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ListingCategory::Sale => "sale",
      ListingCategory::Rent => "rent",
      ListingCategory::Special => "special",
      ListingCategory::Clearance => "clearance",
      ListingCategory::ExclusivePrivate => "exclusive-private",
    }
  }
}

impl fmt::Display for ListingCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ListingCategory {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ListingCategory::ALL
      .into_iter()
      .find(|c| c.as_str() == s.trim().to_lowercase())
      .ok_or_else(|| SyncError::Validation(format!("unknown listing category '{}'", s)))
  }
}

impl PropertyStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      PropertyStatus::Available => "available",
      PropertyStatus::Exclusive => "exclusive",
      PropertyStatus::Reserved => "reserved",
    }
  }
}

/// Agent assigned to a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
  pub name: String,
  #[serde(default)]
  pub specialty: Option<String>,
  #[serde(default)]
  pub rating: Option<f64>,
  #[serde(default)]
  pub deals: Option<u32>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
}

/// Extended detail block shown on the detail page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyDetails {
  pub subtype: Option<String>,
  pub lot_area: Option<f64>,
  pub age_years: Option<u32>,
  pub views: u64,
  pub favorites: u64,
  pub published_display: Option<String>,
}

/// Listing as the application sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
  pub id: i64,
  pub title: String,
  pub location: String,
  pub price: f64,
  pub price_display: String,
  pub property_type: String,
  pub bedrooms: u32,
  pub bathrooms: u32,
  pub area: f64,
  pub area_display: String,
  /// URL or inline `data:` URL
  pub image: String,
  pub description: String,
  pub features: Vec<String>,
  pub status: PropertyStatus,
  pub category: ListingCategory,
  pub published_at: Option<NaiveDate>,
  pub virtual_tour: Option<String>,
  pub gallery: Vec<String>,
  pub agent: Option<Agent>,
  pub details: Option<PropertyDetails>,
}

/// Where an image's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRef<'a> {
  /// Hosted file, referenced by URL
  Url(&'a str),
  /// Base64 payload embedded as a `data:` URL
  Inline(&'a str),
}

impl<'a> ImageRef<'a> {
  pub fn classify(value: &'a str) -> Self {
    if value.starts_with(DATA_URL_PREFIX) {
      ImageRef::Inline(value)
    } else {
      ImageRef::Url(value)
    }
  }

  pub fn is_inline(&self) -> bool {
    matches!(self, ImageRef::Inline(_))
  }
}

impl Property {
  /// Whether the primary image is still stored inline.
  pub fn has_inline_image(&self) -> bool {
    ImageRef::classify(&self.image).is_inline()
  }

  /// Whether any image (primary or gallery) is still stored inline.
  pub fn has_inline_media(&self) -> bool {
    self.has_inline_image()
      || self
        .gallery
        .iter()
        .any(|g| ImageRef::classify(g).is_inline())
  }
}

impl Cacheable for Property {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }
}

/// One window of a paginated collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub page: usize,
  pub page_size: usize,
  /// Total rows matching the query, as reported by the backend
  pub total: u64,
}

/// Format a price with dot thousands separators, e.g. `$350.000.000`.
pub fn format_price(price: f64) -> String {
  let whole = price.round().max(0.0) as u64;
  format!("${}", group_thousands(whole))
}

/// Format an area in square meters, dropping a zero fraction.
pub fn format_area(area: f64) -> String {
  if area.fract() == 0.0 {
    format!("{} m²", area as u64)
  } else {
    format!("{:.1} m²", area)
  }
}

fn group_thousands(n: u64) -> String {
  let digits = n.to_string();
  let mut out = String::with_capacity(digits.len() + digits.len() / 3);
  for (i, ch) in digits.chars().enumerate() {
    if i > 0 && (digits.len() - i) % 3 == 0 {
      out.push('.');
    }
    out.push(ch);
  }
  out
}
