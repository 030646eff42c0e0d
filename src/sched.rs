//! Section rotation scheduler.
//!
//! One long-lived loop walks the fixed section list, one section per tick,
//! asking the fetcher for a single article each time. Strictly serial: the
//! next tick waits for the previous section to finish, so publishers see at
//! most one rotation-driven request stream. A boot-time backfill pass walks
//! every section once before the periodic loop starts, so a cold store
//! reaches the threshold without waiting out full rotation periods.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::fetch::Fetcher;
use crate::model::Section;
use crate::threshold::ThresholdGate;

#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub current_section: Section,
    pub index: usize,
    pub total: usize,
}

struct RotationState {
    index: usize,
    running: bool,
}

pub struct Scheduler {
    fetcher: Arc<Fetcher>,
    gate: Arc<ThresholdGate>,
    sections: Vec<Section>,
    period: Duration,
    state: Mutex<RotationState>,
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<Fetcher>,
        gate: Arc<ThresholdGate>,
        sections: Vec<Section>,
        period: Duration,
    ) -> Self {
        assert!(!sections.is_empty(), "scheduler needs at least one section");
        Self {
            fetcher,
            gate,
            sections,
            period,
            state: Mutex::new(RotationState {
                index: 0,
                running: false,
            }),
        }
    }

    pub async fn status(&self) -> RotationStatus {
        let state = self.state.lock().await;
        RotationStatus {
            current_section: self.sections[state.index % self.sections.len()],
            index: state.index,
            total: self.sections.len(),
        }
    }

    /// Boot-time fill: one pass over every section, one article each. Run
    /// once before the periodic loop so a cold start converges on the
    /// threshold quickly.
    pub async fn backfill(&self) {
        tracing::info!(sections = self.sections.len(), "Running boot backfill pass");
        for &section in &self.sections {
            match self.fetcher.fetch_section(section, 1).await {
                Ok(enriched) => {
                    tracing::debug!(section = %section, enriched = enriched, "Backfill section done")
                }
                Err(e) => {
                    tracing::warn!(section = %section, error = %e, "Backfill section failed")
                }
            }
        }
        if let Err(e) = self.gate.check().await {
            tracing::warn!(error = %e, "Threshold check after backfill failed");
        }
    }

    /// Run the rotation until `shutdown` flips. Start is idempotent: a
    /// second call while a loop is live returns immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        {
            let mut state = self.state.lock().await;
            if state.running {
                tracing::debug!("Scheduler already running, ignoring start");
                return;
            }
            state.running = true;
        }

        let mut interval = tokio::time::interval(self.period);
        // First tick is immediate; missed ticks collapse instead of bursting.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }

        let mut state = self.state.lock().await;
        state.running = false;
        tracing::info!("Scheduler stopped");
    }

    /// One rotation step: fetch the current section, then advance. On wrap,
    /// log the rotation-complete event with per-section enriched counts.
    async fn tick(&self) {
        let (section, index) = {
            let state = self.state.lock().await;
            let index = state.index % self.sections.len();
            (self.sections[index], index)
        };

        tracing::debug!(section = %section, index = index, "Rotation tick");
        if let Err(e) = self.fetcher.fetch_section(section, 1).await {
            tracing::warn!(section = %section, error = %e, "Section fetch failed");
        }

        let wrapped = {
            let mut state = self.state.lock().await;
            state.index = (state.index + 1) % self.sections.len();
            state.index == 0
        };

        if wrapped {
            match self.gate.check().await {
                Ok(status) => {
                    let counts: Vec<String> = status
                        .sections
                        .iter()
                        .map(|s| format!("{}={}", s.section, s.count))
                        .collect();
                    tracing::info!(
                        gate_open = status.met,
                        counts = %counts.join(" "),
                        "Rotation complete"
                    );
                }
                Err(e) => tracing::warn!(error = %e, "Threshold check on rotation wrap failed"),
            }
        }
    }
}
