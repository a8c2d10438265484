//! Find an on-screen control and click it, or fall back to a key press.
//!
//! One invocation walks `Opening → Settling → Searching → Found → Acting` or
//! `... → TimedOut → Fallback`, then always `Closing → Done`. No state is
//! entered twice and the surface is released on every path, errors included.

use crate::clock::Clock;
use crate::controller::{FocusMethod, InteractionController, KeyChord, SurfaceHandle};
use crate::matcher::{Match, Region, TemplateMatcher};
use crate::util::panic_message;
use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Opening,
    Settling,
    Searching,
    Found,
    Acting,
    TimedOut,
    Fallback,
    Closing,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireStrategy {
    /// Search for the template and click it; press the fallback key on timeout.
    #[default]
    TemplateClick,
    /// Skip the search and press the fallback key after settling.
    KeyOnly,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub strategy: AcquireStrategy,
    pub focus: FocusMethod,
    pub settle: Duration,
    pub poll_interval: Duration,
    pub fallback_key: KeyChord,
    pub post_action_wait: Duration,
    pub post_close_wait: Duration,
    pub nudge_pointer: bool,
    pub max_capture_errors: u32,
}

/// What to look for on screen during one attempt.
#[derive(Debug, Clone)]
pub struct ScreenTarget {
    pub template: Arc<DynamicImage>,
    pub template_path: PathBuf,
    pub confidence: f64,
    pub search_deadline: Duration,
}

pub fn load_template(path: &Path) -> Result<Arc<DynamicImage>> {
    let image = image::open(path)
        .with_context(|| format!("failed to load template image: {}", path.display()))?;
    Ok(Arc::new(image))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LoopOutcome {
    Clicked {
        region: Region,
        score: f64,
        elapsed_ms: u64,
    },
    Fallback {
        elapsed_ms: u64,
        attempts: u32,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopRun {
    pub outcome: LoopOutcome,
    pub trace: Vec<LoopState>,
    /// Capture-and-match attempts made while searching.
    pub attempts: u32,
}

impl LoopRun {
    #[cfg(test)]
    pub fn visited(&self, state: LoopState) -> usize {
        self.trace.iter().filter(|s| **s == state).count()
    }
}

struct Progress {
    trace: Vec<LoopState>,
    attempts: u32,
}

impl Progress {
    fn enter(&mut self, state: LoopState) {
        debug_assert!(!self.trace.contains(&state), "loop state {state:?} revisited");
        debug!(state = ?state, "visual loop transition");
        self.trace.push(state);
    }
}

/// Runs a controller step with panics folded into its error, so a failing
/// backend cannot unwind past `Closing`.
fn shielded<T>(step: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(step))
        .unwrap_or_else(|payload| Err(anyhow!("panic: {}", panic_message(payload.as_ref()))))
}

pub struct VisualActionLoop {
    controller: Arc<dyn InteractionController>,
    clock: Arc<dyn Clock>,
    matcher: TemplateMatcher,
    settings: LoopSettings,
}

impl VisualActionLoop {
    pub fn new(
        controller: Arc<dyn InteractionController>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            controller,
            clock,
            matcher: TemplateMatcher::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn run(&self, destination: &str, target: &ScreenTarget) -> LoopRun {
        let mut progress = Progress {
            trace: Vec::with_capacity(7),
            attempts: 0,
        };

        progress.enter(LoopState::Opening);
        let opened = shielded(|| self.controller.open_surface(destination));
        let outcome = match &opened {
            Ok(handle) => {
                match shielded(|| self.engage(handle, target, &mut progress)) {
                    Ok(outcome) => outcome,
                    Err(err) => LoopOutcome::Failed {
                        reason: format!("{err:#}"),
                    },
                }
            }
            Err(err) => LoopOutcome::Failed {
                reason: format!("failed to open surface: {err:#}"),
            },
        };

        progress.enter(LoopState::Closing);
        match opened {
            Ok(handle) => {
                let id = handle.id;
                if let Err(err) = shielded(|| self.controller.close_surface(handle)) {
                    warn!(surface = id, error = %format!("{err:#}"), "failed to close surface");
                }
            }
            Err(_) => debug!("no surface to close"),
        }
        self.clock.sleep(self.settings.post_close_wait);
        progress.enter(LoopState::Done);

        LoopRun {
            outcome,
            trace: progress.trace,
            attempts: progress.attempts,
        }
    }

    fn engage(
        &self,
        handle: &SurfaceHandle,
        target: &ScreenTarget,
        progress: &mut Progress,
    ) -> Result<LoopOutcome> {
        progress.enter(LoopState::Settling);
        self.clock.sleep(self.settings.settle);
        if self.settings.focus != FocusMethod::None {
            if let Err(err) = self.controller.focus(handle, self.settings.focus) {
                warn!(error = %format!("{err:#}"), "focus request failed, continuing");
            }
        }
        if self.settings.nudge_pointer {
            if let Err(err) = self.nudge_pointer() {
                debug!(error = %format!("{err:#}"), "pointer nudge failed");
            }
        }

        let search_started = self.clock.now();
        let found = match self.settings.strategy {
            AcquireStrategy::TemplateClick => {
                progress.enter(LoopState::Searching);
                self.search(target, search_started, progress)?
            }
            AcquireStrategy::KeyOnly => None,
        };
        let elapsed_ms = self.elapsed_ms(search_started);

        match found {
            Some(found) => {
                progress.enter(LoopState::Found);
                progress.enter(LoopState::Acting);
                self.controller
                    .move_and_click(&found.region)
                    .context("failed to click target")?;
                let (x, y) = found.region.center();
                info!(x, y, score = found.score, elapsed_ms, "target clicked");
                self.clock.sleep(self.settings.post_action_wait);
                Ok(LoopOutcome::Clicked {
                    region: found.region,
                    score: found.score,
                    elapsed_ms,
                })
            }
            None => {
                progress.enter(LoopState::TimedOut);
                progress.enter(LoopState::Fallback);
                self.controller
                    .press_key(&self.settings.fallback_key)
                    .context("failed to press fallback key")?;
                info!(key = %self.settings.fallback_key, elapsed_ms, "fallback key pressed");
                self.clock.sleep(self.settings.post_action_wait);
                Ok(LoopOutcome::Fallback {
                    elapsed_ms,
                    attempts: progress.attempts,
                })
            }
        }
    }

    /// Captures and matches every poll interval until found or the deadline passes.
    fn search(
        &self,
        target: &ScreenTarget,
        started: Instant,
        progress: &mut Progress,
    ) -> Result<Option<Match>> {
        let mut capture_errors = 0u32;
        loop {
            progress.attempts += 1;
            match self.controller.capture() {
                Ok(frame) => {
                    capture_errors = 0;
                    let best = self.matcher.best_match(&frame, &target.template);
                    match best {
                        Some(found) if found.score >= target.confidence => return Ok(Some(found)),
                        other => info!(
                            attempt = progress.attempts,
                            elapsed_ms = self.elapsed_ms(started),
                            best_score = other.map(|m| m.score),
                            template = %target.template_path.display(),
                            "target not found"
                        ),
                    }
                }
                Err(err) => {
                    capture_errors += 1;
                    warn!(
                        attempt = progress.attempts,
                        consecutive = capture_errors,
                        error = %format!("{err:#}"),
                        "screen capture failed"
                    );
                    if capture_errors > self.settings.max_capture_errors {
                        bail!("screen capture failed {capture_errors} times in a row: {err:#}");
                    }
                }
            }

            self.clock.sleep(self.settings.poll_interval);
            if self.clock.now().saturating_duration_since(started) >= target.search_deadline {
                return Ok(None);
            }
        }
    }

    /// Some pages only paint after pointer movement.
    fn nudge_pointer(&self) -> Result<()> {
        let (w, h) = self.controller.screen_size()?;
        let (cx, cy) = (w / 2, h / 2);
        self.controller.move_pointer(cx, cy)?;
        self.controller.move_pointer(cx.saturating_add(80).min(w.saturating_sub(1)), cy)?;
        self.controller.move_pointer(cx.saturating_sub(80), cy)?;
        Ok(())
    }

    fn elapsed_ms(&self, since: Instant) -> u64 {
        self.clock.now().saturating_duration_since(since).as_millis() as u64
    }
}
