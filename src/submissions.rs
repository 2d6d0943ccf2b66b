//! Owner submissions: leads from owners who want to list a property.
//!
//! Stored locally as one JSON array under a fixed key; no server round trip.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::backend::types::ListingCategory;
use crate::db::LocalStore;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
  Pending,
  Contacted,
  Approved,
  Rejected,
}

impl SubmissionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SubmissionStatus::Pending => "pending",
      SubmissionStatus::Contacted => "contacted",
      SubmissionStatus::Approved => "approved",
      SubmissionStatus::Rejected => "rejected",
    }
  }

  /// Staff workflow: pending leads are contacted or turned down, contacted
  /// leads are approved or turned down. Approved and rejected are final.
  pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
    use SubmissionStatus::*;
    matches!(
      (*self, next),
      (Pending, Contacted) | (Pending, Rejected) | (Contacted, Approved) | (Contacted, Rejected)
    )
  }
}

impl fmt::Display for SubmissionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SubmissionStatus {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "pending" => Ok(SubmissionStatus::Pending),
      "contacted" => Ok(SubmissionStatus::Contacted),
      "approved" => Ok(SubmissionStatus::Approved),
      "rejected" => Ok(SubmissionStatus::Rejected),
      other => Err(SyncError::Validation(format!(
        "unknown submission status '{}'",
        other
      ))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerContact {
  pub name: String,
  pub email: String,
  pub phone: String,
}

/// Property as described by the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedProperty {
  pub property_type: String,
  pub location: String,
  pub price: f64,
  #[serde(default)]
  pub bedrooms: u32,
  #[serde(default)]
  pub bathrooms: u32,
  pub area: f64,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub features: Vec<String>,
  #[serde(default = "default_category")]
  pub category: ListingCategory,
}

fn default_category() -> ListingCategory {
  ListingCategory::Sale
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
  /// Agreed to the terms and data-processing policy
  pub terms: bool,
  /// Agreed to be contacted by an agent
  pub contact: bool,
}

/// Form input for a new submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubmission {
  pub owner: OwnerContact,
  pub property: SubmittedProperty,
  #[serde(default)]
  pub consent: Consent,
}

impl NewSubmission {
  /// Check the form before anything is stored.
  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: &str| -> Result<()> { Err(SyncError::Validation(msg.to_string())) };

    if self.owner.name.trim().is_empty() {
      return invalid("owner name is required");
    }
    let email = self.owner.email.trim();
    match email.split_once('@') {
      Some((user, domain)) if !user.is_empty() && domain.contains('.') => {}
      _ => return invalid("a valid email address is required"),
    }
    if self.owner.phone.chars().filter(|c| c.is_ascii_digit()).count() < 7 {
      return invalid("a phone number with at least 7 digits is required");
    }
    if self.property.location.trim().is_empty() {
      return invalid("property location is required");
    }
    if !(self.property.price > 0.0) {
      return invalid("price must be greater than zero");
    }
    if !(self.property.area > 0.0) {
      return invalid("area must be greater than zero");
    }
    if !self.consent.terms {
      return invalid("the terms must be accepted");
    }
    Ok(())
  }
}

/// A stored lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerSubmission {
  pub id: String,
  pub status: SubmissionStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  pub owner: OwnerContact,
  pub property: SubmittedProperty,
  pub consent: Consent,
}

fn new_submission_id(now: DateTime<Utc>) -> String {
  let suffix: u32 = rand::thread_rng().gen_range(0..0x10000);
  format!("sub-{}-{:04x}", now.timestamp_millis(), suffix)
}

pub struct SubmissionStore {
  store: Arc<LocalStore>,
  key: String,
}

impl SubmissionStore {
  pub fn new(store: Arc<LocalStore>, key: &str) -> Self {
    Self {
      store,
      key: key.to_string(),
    }
  }

  pub fn create(&self, input: NewSubmission) -> Result<OwnerSubmission> {
    input.validate()?;
    let now = Utc::now();
    let submission = OwnerSubmission {
      id: new_submission_id(now),
      status: SubmissionStatus::Pending,
      created_at: now,
      updated_at: None,
      owner: input.owner,
      property: input.property,
      consent: input.consent,
    };

    let stored = submission.clone();
    self
      .store
      .update::<Vec<OwnerSubmission>, _, _>(&self.key, move |all| {
        all.push(stored);
        Ok(())
      })?;
    info!(id = %submission.id, "Stored owner submission");
    Ok(submission)
  }

  /// All submissions, newest first.
  pub fn list(&self) -> Result<Vec<OwnerSubmission>> {
    let mut all: Vec<OwnerSubmission> = self.store.get(&self.key)?.unwrap_or_default();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(all)
  }

  pub fn get(&self, id: &str) -> Result<Option<OwnerSubmission>> {
    Ok(self.list()?.into_iter().find(|s| s.id == id))
  }

  pub fn set_status(&self, id: &str, status: SubmissionStatus) -> Result<OwnerSubmission> {
    let updated = self
      .store
      .update::<Vec<OwnerSubmission>, _, _>(&self.key, |all| {
        let submission = all
          .iter_mut()
          .find(|s| s.id == id)
          .ok_or_else(|| SyncError::NotFound(format!("submission {}", id)))?;
        if !submission.status.can_transition_to(status) {
          return Err(SyncError::Validation(format!(
            "cannot move submission from {} to {}",
            submission.status, status
          )));
        }
        submission.status = status;
        submission.updated_at = Some(Utc::now());
        Ok(submission.clone())
      })?;
    info!(id, status = %status, "Submission status changed");
    Ok(updated)
  }

  /// Remove a submission. Returns whether it existed.
  pub fn delete(&self, id: &str) -> Result<bool> {
    self
      .store
      .update::<Vec<OwnerSubmission>, _, _>(&self.key, |all| {
        let before = all.len();
        all.retain(|s| s.id != id);
        Ok(all.len() < before)
      })
  }
}
