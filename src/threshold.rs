//! Threshold gate: cache publication stays closed until every section holds
//! a minimum number of enriched articles.
//!
//! The gate only controls cache admission (section FIFO publication). It
//! never blocks store writes and never blocks reads that go to the store
//! directly — a half-filled site serves articles by id while the section
//! lists stay empty.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::model::Section;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct SectionStatus {
    pub section: Section,
    pub count: i64,
    pub met: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdStatus {
    pub threshold: u32,
    pub sections: Vec<SectionStatus>,
    pub met: bool,
}

pub struct ThresholdGate {
    store: Arc<Store>,
    threshold: u32,
    /// Sections the gate watches — the scheduler's rotation list. Sections
    /// outside this list never hold the gate closed.
    sections: Vec<Section>,
    /// Last computed status; `is_open` reads this without touching the store.
    last: Mutex<Option<ThresholdStatus>>,
}

impl ThresholdGate {
    pub fn new(store: Arc<Store>, threshold: u32, sections: Vec<Section>) -> Self {
        Self {
            store,
            threshold,
            sections,
            last: Mutex::new(None),
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Like [`check`](Self::check), additionally reporting whether this call
    /// transitioned the gate from closed to open — the moment the catch-up
    /// publisher fires.
    pub async fn check_transition(&self) -> Result<(ThresholdStatus, bool), StoreError> {
        let was_open = self.is_open().await;
        let status = self.check().await?;
        Ok((status.clone(), status.met && !was_open))
    }

    /// Recompute per-section enriched counts from the store and refresh the
    /// cached gate state.
    pub async fn check(&self) -> Result<ThresholdStatus, StoreError> {
        let counts = self.store.enriched_counts_by_section().await?;
        let sections: Vec<SectionStatus> = self
            .sections
            .iter()
            .map(|&section| {
                let count = counts.get(&section).copied().unwrap_or(0);
                SectionStatus {
                    section,
                    count,
                    met: count >= self.threshold as i64,
                }
            })
            .collect();
        let met = sections.iter().all(|s| s.met);
        let status = ThresholdStatus {
            threshold: self.threshold,
            sections,
            met,
        };

        let mut last = self.last.lock().await;
        let was_open = last.as_ref().is_some_and(|s| s.met);
        if met && !was_open {
            tracing::info!(threshold = self.threshold, "Section threshold met, cache gate open");
        } else if !met && was_open {
            tracing::warn!(threshold = self.threshold, "Section threshold no longer met, cache gate closed");
        }
        *last = Some(status.clone());
        Ok(status)
    }

    /// Cached gate state from the most recent [`check`](Self::check); closed
    /// until the first check completes.
    pub async fn is_open(&self) -> bool {
        self.last.lock().await.as_ref().is_some_and(|s| s.met)
    }

    /// Last computed status for the observability surface, recomputing if no
    /// check has run yet.
    pub async fn status(&self) -> Result<ThresholdStatus, StoreError> {
        if let Some(status) = self.last.lock().await.clone() {
            return Ok(status);
        }
        self.check().await
    }
}
