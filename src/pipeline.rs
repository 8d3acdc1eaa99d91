#![forbid(unsafe_code)]

//! Ordered fallback chain over [`Strategy`] values.
//!
//! Strategies are tried one after another in priority order. The first
//! acceptable success wins and nothing after it runs. When a stream is wanted,
//! a metadata-only success is remembered but the chain keeps going through the
//! stream-capable strategies; metadata-only strategies are skipped once some
//! metadata is in hand. If nothing produced metadata the terminal strategy
//! fabricates it from the identifier.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::metadata::{PartialMetadata, VideoMetadata};
use crate::reference::VideoReference;
use crate::strategy::{AudioSource, IdentifierFallback, Strategy};

pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(60);

/// Outcome of [`Resolver::resolve`].
#[derive(Debug)]
pub struct Resolution {
    pub metadata: VideoMetadata,
    /// Only ever set when a stream was requested.
    pub audio: Option<AudioSource>,
    /// Name of the strategy whose metadata was used.
    pub strategy: String,
    /// Strategies that failed along the way, with the reason.
    pub failures: Vec<StrategyFailure>,
}

#[derive(Debug, Clone)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

pub struct Resolver {
    strategies: Vec<Arc<dyn Strategy>>,
    terminal: Arc<dyn Strategy>,
    budget: Duration,
}

impl Resolver {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self {
            strategies,
            terminal: Arc::new(IdentifierFallback),
            budget: DEFAULT_REQUEST_BUDGET,
        }
    }

    pub fn with_terminal(mut self, terminal: Arc<dyn Strategy>) -> Self {
        self.terminal = terminal;
        self
    }

    /// Overall deadline shared by every attempt of a single `resolve` call.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies
            .iter()
            .map(|strategy| strategy.name())
            .chain(std::iter::once(self.terminal.name()))
            .collect()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn can_stream(&self) -> bool {
        self.strategies
            .iter()
            .any(|strategy| strategy.supplies_stream())
    }

    /// Only a [`ResolveError::VideoUnavailable`] reported by some strategy,
    /// with no other strategy producing metadata, is returned as an error.
    /// Every other failure ends at the terminal strategy.
    pub async fn resolve(
        &self,
        reference: &VideoReference,
        want_stream: bool,
    ) -> Result<Resolution, ResolveError> {
        self.resolve_until(reference, want_stream, Instant::now() + self.budget)
            .await
    }

    /// Same as [`Resolver::resolve`] against a deadline owned by the caller,
    /// so later request stages can share what is left of it.
    pub async fn resolve_until(
        &self,
        reference: &VideoReference,
        want_stream: bool,
        deadline: Instant,
    ) -> Result<Resolution, ResolveError> {
        let mut failures = Vec::new();
        let mut best: Option<(PartialMetadata, String)> = None;
        let mut unavailable: Option<ResolveError> = None;

        for strategy in &self.strategies {
            if best.is_some() && !strategy.supplies_stream() {
                debug!(strategy = strategy.name(), "skipping metadata-only strategy");
                continue;
            }

            debug!(strategy = strategy.name(), video = reference.id(), "attempting");
            let outcome = match timeout_at(deadline, strategy.attempt(reference, want_stream)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ResolveError::Timeout(self.budget)),
            };

            match outcome {
                Ok(extraction) if !want_stream || extraction.audio.is_some() => {
                    info!(strategy = strategy.name(), video = reference.id(), "resolved");
                    return Ok(Resolution {
                        metadata: extraction.metadata.normalize(reference),
                        audio: extraction.audio.filter(|_| want_stream),
                        strategy: strategy.name().to_string(),
                        failures,
                    });
                }
                Ok(extraction) => {
                    info!(
                        strategy = strategy.name(),
                        video = reference.id(),
                        "metadata only, still looking for a stream"
                    );
                    if best.is_none() {
                        best = Some((extraction.metadata, strategy.name().to_string()));
                    }
                }
                Err(err) => {
                    warn!(strategy = strategy.name(), video = reference.id(), error = %err, "strategy failed");
                    failures.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        reason: err.to_string(),
                    });
                    if err.is_unavailable() && unavailable.is_none() {
                        unavailable = Some(err);
                    }
                }
            }
        }

        if let Some((metadata, strategy)) = best {
            info!(%strategy, video = reference.id(), "no stream available, using best metadata");
            return Ok(Resolution {
                metadata: metadata.normalize(reference),
                audio: None,
                strategy,
                failures,
            });
        }

        if let Some(err) = unavailable {
            return Err(err);
        }

        warn!(
            video = reference.id(),
            error = %ResolveError::AllStrategiesFailed,
            "falling back to {}",
            self.terminal.name()
        );
        let metadata = match self.terminal.attempt(reference, false).await {
            Ok(extraction) => extraction.metadata,
            Err(err) => {
                warn!(strategy = self.terminal.name(), error = %err, "terminal strategy failed");
                PartialMetadata::default()
            }
        };
        Ok(Resolution {
            metadata: metadata.normalize(reference),
            audio: None,
            strategy: self.terminal.name().to_string(),
            failures,
        })
    }
}
