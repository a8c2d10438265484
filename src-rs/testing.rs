//! In-memory stand-ins for the desktop, mail, upload and generation seams.

use crate::clock::{Clock, ManualClock};
use crate::controller::{FocusMethod, InteractionController, KeyChord, SurfaceHandle};
use crate::error::{MailError, RunError, UploadError};
use crate::generation::GenerationStep;
use crate::matcher::fixtures::{blocky, with_template};
use crate::matcher::Region;
use crate::channels::{MailTransport, OutgoingMail, UploadTransport};
use anyhow::{bail, Result};
use image::{DynamicImage, GrayImage};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Surface {
    id: u64,
    appear_after: Option<Duration>,
    first_capture: Option<Instant>,
}

#[derive(Default)]
struct DesktopState {
    schedule: VecDeque<Option<Duration>>,
    current: Option<Surface>,
    next_id: u64,
    capture_failures: u32,
    fail_open: bool,
    fail_close: bool,
    fail_keys: bool,
    events: Vec<String>,
}

/// A fake screen. Each opened surface takes the next entry of the schedule:
/// the target shows up that long after the surface's first capture, or never.
pub(crate) struct ScriptedDesktop {
    clock: Arc<ManualClock>,
    background: GrayImage,
    template: GrayImage,
    position: (u32, u32),
    // Outside the mutex so a panicking capture leaves the state usable.
    panic_on_capture: bool,
    state: Mutex<DesktopState>,
}

impl ScriptedDesktop {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            background: blocky(320, 180, 4, 11),
            template: blocky(32, 32, 4, 12),
            position: (160, 96),
            panic_on_capture: false,
            state: Mutex::new(DesktopState::default()),
        }
    }

    pub(crate) fn appear_after(mut self, when: Option<Duration>) -> Self {
        self.state_mut().schedule.push_back(when);
        self
    }

    pub(crate) fn fail_captures(mut self, count: u32) -> Self {
        self.state_mut().capture_failures = count;
        self
    }

    pub(crate) fn fail_open(mut self) -> Self {
        self.state_mut().fail_open = true;
        self
    }

    pub(crate) fn fail_close(mut self) -> Self {
        self.state_mut().fail_close = true;
        self
    }

    pub(crate) fn panic_on_capture(mut self) -> Self {
        self.panic_on_capture = true;
        self
    }

    pub(crate) fn fail_keys(mut self) -> Self {
        self.state_mut().fail_keys = true;
        self
    }

    pub(crate) fn template_image(&self) -> DynamicImage {
        DynamicImage::ImageLuma8(self.template.clone())
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn state_mut(&mut self) -> &mut DesktopState {
        self.state.get_mut().unwrap()
    }

    fn log(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }
}

impl InteractionController for ScriptedDesktop {
    fn open_surface(&self, target: &str) -> Result<SurfaceHandle> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("open:{target}"));
        if state.fail_open {
            bail!("browser failed to start");
        }
        state.next_id += 1;
        let id = state.next_id;
        let appear_after = state.schedule.pop_front().flatten();
        state.current = Some(Surface {
            id,
            appear_after,
            first_capture: None,
        });
        Ok(SurfaceHandle {
            id,
            target: target.to_string(),
            pid: None,
        })
    }

    fn focus(&self, _handle: &SurfaceHandle, method: FocusMethod) -> Result<()> {
        let label = match method {
            FocusMethod::None => "none",
            FocusMethod::Activate => "activate",
            FocusMethod::AltTab => "alt_tab",
        };
        self.log(format!("focus:{label}"));
        Ok(())
    }

    fn screen_size(&self) -> Result<(u32, u32)> {
        Ok(self.background.dimensions())
    }

    fn move_pointer(&self, x: u32, y: u32) -> Result<()> {
        self.log(format!("move:{x},{y}"));
        Ok(())
    }

    fn move_and_click(&self, region: &Region) -> Result<()> {
        let (x, y) = region.center();
        self.log(format!("click:{x},{y}"));
        Ok(())
    }

    fn press_key(&self, chord: &KeyChord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("key:{chord}"));
        if state.fail_keys {
            bail!("key injection refused");
        }
        Ok(())
    }

    fn capture(&self) -> Result<DynamicImage> {
        if self.panic_on_capture {
            self.log("capture".to_string());
            panic!("capture backend crashed");
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.events.push("capture".to_string());
        let visible = match state.current.as_mut() {
            Some(surface) => {
                let first = *surface.first_capture.get_or_insert(now);
                surface
                    .appear_after
                    .is_some_and(|after| now.saturating_duration_since(first) >= after)
            }
            None => false,
        };
        if state.capture_failures > 0 {
            state.capture_failures -= 1;
            bail!("screenshot tool exited with status 1");
        }
        let frame = if visible {
            with_template(&self.background, &self.template, self.position.0, self.position.1)
        } else {
            self.background.clone()
        };
        Ok(DynamicImage::ImageLuma8(frame))
    }

    fn close_surface(&self, handle: SurfaceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("close:{}", handle.id));
        if state.current.as_ref().is_some_and(|s| s.id == handle.id) {
            state.current = None;
        }
        if state.fail_close {
            bail!("window already gone");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentMail {
    pub to: String,
    pub subject: String,
    pub attachment: String,
    pub inline_image: bool,
}

#[derive(Default)]
pub(crate) struct RecordingMailer {
    pub sent: Mutex<Vec<SentMail>>,
    pub fail_with: Option<String>,
}

impl MailTransport for RecordingMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<String, MailError> {
        if let Some(message) = &self.fail_with {
            return Err(MailError(message.clone()));
        }
        self.sent.lock().unwrap().push(SentMail {
            to: mail.to.email.to_string(),
            subject: mail.subject.clone(),
            attachment: mail.attachment.file_name.clone(),
            inline_image: mail.inline_image.is_some(),
        });
        Ok("250 OK queued".to_string())
    }
}

#[derive(Default)]
pub(crate) struct ScriptedUploader {
    pub uploads: Mutex<Vec<(String, String)>>,
    pub reject_auth: bool,
}

impl UploadTransport for ScriptedUploader {
    fn upload(&self, _file: &Path, name: &str, folder: &str) -> Result<String, UploadError> {
        if self.reject_auth {
            return Err(UploadError::Auth("token refresh rejected (400): invalid_grant".to_string()));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((name.to_string(), folder.to_string()));
        Ok(format!("file-{folder}"))
    }
}

/// Writes a fixed artifact, or fails, and counts invocations.
pub(crate) struct StaticGeneration {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StaticGeneration {
    pub(crate) fn succeeding() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

impl GenerationStep for StaticGeneration {
    fn run(&self, artifact_path: &Path) -> Result<(), RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RunError::Generation("notebook raised an exception".to_string()));
        }
        if let Some(parent) = artifact_path.parent() {
            fs::create_dir_all(parent).map_err(|err| RunError::Generation(err.to_string()))?;
        }
        fs::write(artifact_path, b"report").map_err(|err| RunError::Generation(err.to_string()))
    }
}
