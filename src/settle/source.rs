//! Agreement identifier sourcing
//!
//! The settlement pipeline consumes an ordered batch of integer agreement
//! identifiers. Where those identifiers come from is a collaborator concern
//! hidden behind [`AgreementSource`]; the implementations here are the
//! range/static placeholders used until the real due-agreement query exists.

use crate::config::{SourceConfig, SourceKind};
use crate::error::{SettlerError, SettlerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Ordered batch of agreement identifiers for one settlement cycle.
///
/// Uniqueness is not enforced; duplicate identifiers are wasteful but the
/// contract treats them as no-ops. The batch is built fresh per cycle and
/// discarded when the cycle ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementBatch(Vec<u64>);

impl AgreementBatch {
    pub fn new(ids: Vec<u64>) -> Self {
        Self(ids)
    }

    /// Inclusive range of identifiers.
    pub fn from_range(first: u64, last: u64) -> Self {
        Self((first..=last).collect())
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact rendering for log lines; long batches are truncated.
    pub fn summary(&self) -> String {
        const SHOWN: usize = 8;
        if self.0.len() <= SHOWN {
            format!("{:?} ({} ids)", self.0, self.0.len())
        } else {
            let head: Vec<u64> = self.0[..SHOWN].to_vec();
            format!(
                "{:?}.. ({} ids, last {})",
                head,
                self.0.len(),
                self.0[self.0.len() - 1]
            )
        }
    }
}

/// Supplies the identifiers due for settlement at a given instant.
#[async_trait]
pub trait AgreementSource: Send + Sync {
    async fn fetch_due(&self, as_of: DateTime<Utc>) -> SettlerResult<AgreementBatch>;

    /// Human-readable description for startup logging.
    fn describe(&self) -> String;
}

/// Placeholder source yielding a fixed inclusive identifier range.
//
// TODO: replace with a query against the agreements backend once its
// due-date API lands; the trait boundary above is shaped for that swap.
pub struct RangeSource {
    first: u64,
    last: u64,
}

impl RangeSource {
    pub fn new(first: u64, last: u64) -> SettlerResult<Self> {
        if last < first {
            return Err(SettlerError::Config(format!(
                "range source bounds inverted: {}..{}",
                first, last
            )));
        }
        Ok(Self { first, last })
    }
}

#[async_trait]
impl AgreementSource for RangeSource {
    async fn fetch_due(&self, _as_of: DateTime<Utc>) -> SettlerResult<AgreementBatch> {
        Ok(AgreementBatch::from_range(self.first, self.last))
    }

    fn describe(&self) -> String {
        format!("range source [{}..={}]", self.first, self.last)
    }
}

/// Placeholder source yielding a fixed identifier list from configuration.
pub struct StaticSource {
    ids: Vec<u64>,
}

impl StaticSource {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids }
    }
}

#[async_trait]
impl AgreementSource for StaticSource {
    async fn fetch_due(&self, _as_of: DateTime<Utc>) -> SettlerResult<AgreementBatch> {
        Ok(AgreementBatch::new(self.ids.clone()))
    }

    fn describe(&self) -> String {
        format!("static source ({} ids)", self.ids.len())
    }
}

/// Build the configured source implementation.
pub fn from_config(config: &SourceConfig) -> SettlerResult<Arc<dyn AgreementSource>> {
    match config.kind {
        SourceKind::Range => {
            let (first, last) = match (config.first_id, config.last_id) {
                (Some(f), Some(l)) => (f, l),
                _ => {
                    return Err(SettlerError::Config(
                        "range source requires first_id and last_id".to_string(),
                    ))
                }
            };
            Ok(Arc::new(RangeSource::new(first, last)?))
        }
        SourceKind::Static => {
            let ids = config.ids.clone().ok_or_else(|| {
                SettlerError::Config("static source requires ids".to_string())
            })?;
            Ok(Arc::new(StaticSource::new(ids)))
        }
    }
}
