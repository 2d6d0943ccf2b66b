//! Cache keys derived from query parameters.

use crate::backend::types::ListingCategory;

/// Query key types for listing queries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
  /// A single listing by id
  Property(i64),
  /// The full listing collection
  Properties,
  /// Listings in one category
  Category(ListingCategory),
  /// One window of the paginated collection
  Page { page: usize, size: usize },
}

impl QueryKey {
  /// Prefix shared by every category key.
  pub const CATEGORY_PREFIX: &'static str = "properties:category:";

  /// Prefix shared by every page key, whatever the page size.
  pub const PAGE_PREFIX: &'static str = "properties:page:";

  /// Stable string key used in the cache store.
  pub fn cache_key(&self) -> String {
    match self {
      Self::Property(id) => format!("property:{}", id),
      Self::Properties => "properties".to_string(),
      Self::Category(category) => format!("{}{}", Self::CATEGORY_PREFIX, category.as_str()),
      Self::Page { page, size } => format!("{}{}:{}", Self::PAGE_PREFIX, size, page),
    }
  }

}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_are_distinct_per_parameter() {
    let keys = [
      QueryKey::Property(1).cache_key(),
      QueryKey::Property(2).cache_key(),
      QueryKey::Properties.cache_key(),
      QueryKey::Category(ListingCategory::Rent).cache_key(),
      QueryKey::Category(ListingCategory::Sale).cache_key(),
      QueryKey::Page { page: 0, size: 20 }.cache_key(),
      QueryKey::Page { page: 1, size: 20 }.cache_key(),
    ];
    let unique: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
  }

  #[test]
  fn test_views_share_prefixes() {
    let page = QueryKey::Page { page: 3, size: 20 }.cache_key();
    assert!(page.starts_with(QueryKey::PAGE_PREFIX));
    let category = QueryKey::Category(ListingCategory::Rent).cache_key();
    assert!(category.starts_with(QueryKey::CATEGORY_PREFIX));
    assert!(!QueryKey::Properties.cache_key().starts_with(QueryKey::PAGE_PREFIX));
    assert!(!QueryKey::Property(1).cache_key().starts_with(QueryKey::CATEGORY_PREFIX));
  }
}
