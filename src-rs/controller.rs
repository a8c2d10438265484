//! Pointer, keyboard, capture and window control.
//!
//! Every operation is best-effort against a window manager we do not own:
//! a successful call only means the OS tool accepted the request.

use crate::config::ControllerConfig;
use crate::matcher::Region;
use crate::process::{command_exists, run_checked, spawn_detached};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use image::DynamicImage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMethod {
    None,
    /// Raise the browser window by class (Linux) or application name (macOS).
    Activate,
    #[default]
    AltTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Super,
}

/// A key with optional modifiers, written `alt+f4`, `ctrl+w` or `enter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    pub modifiers: Vec<Modifier>,
    pub key: String,
}

impl FromStr for KeyChord {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<String> = raw
            .split('+')
            .map(|part| part.trim().to_ascii_lowercase())
            .collect();
        let (key, mods) = parts
            .split_last()
            .ok_or_else(|| anyhow!("empty key chord"))?;
        if key.is_empty() {
            bail!("key chord '{raw}' has no key");
        }
        let mut modifiers = Vec::with_capacity(mods.len());
        for name in mods {
            modifiers.push(match name.as_str() {
                "ctrl" | "control" => Modifier::Ctrl,
                "alt" | "option" => Modifier::Alt,
                "shift" => Modifier::Shift,
                "super" | "cmd" | "command" | "meta" => Modifier::Super,
                other => bail!("unknown modifier '{other}' in key chord '{raw}'"),
            });
        }
        Ok(Self {
            modifiers,
            key: key.clone(),
        })
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            let name = match modifier {
                Modifier::Ctrl => "ctrl",
                Modifier::Alt => "alt",
                Modifier::Shift => "shift",
                Modifier::Super => "super",
            };
            write!(f, "{name}+")?;
        }
        f.write_str(&self.key)
    }
}

impl KeyChord {
    /// xdotool keysym syntax, e.g. `alt+F4`, `Return`.
    pub fn xdotool_spec(&self) -> String {
        let key = match self.key.as_str() {
            "enter" | "return" => "Return".to_string(),
            "esc" | "escape" => "Escape".to_string(),
            "tab" => "Tab".to_string(),
            "space" => "space".to_string(),
            "backspace" => "BackSpace".to_string(),
            "delete" => "Delete".to_string(),
            other if other.len() > 1 && other.starts_with('f') && other[1..].parse::<u8>().is_ok() => {
                other.to_ascii_uppercase()
            }
            other => other.to_string(),
        };
        let mut parts: Vec<String> = self
            .modifiers
            .iter()
            .map(|m| {
                match m {
                    Modifier::Ctrl => "ctrl",
                    Modifier::Alt => "alt",
                    Modifier::Shift => "shift",
                    Modifier::Super => "super",
                }
                .to_string()
            })
            .collect();
        parts.push(key);
        parts.join("+")
    }

    /// AppleScript System Events statement for this chord.
    pub fn applescript(&self) -> String {
        let code = match self.key.as_str() {
            "enter" | "return" => Some(36),
            "tab" => Some(48),
            "space" => Some(49),
            "backspace" => Some(51),
            "esc" | "escape" => Some(53),
            "delete" => Some(117),
            "f4" => Some(118),
            _ => None,
        };
        let using = if self.modifiers.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = self
                .modifiers
                .iter()
                .map(|m| match m {
                    Modifier::Ctrl => "control down",
                    Modifier::Alt => "option down",
                    Modifier::Shift => "shift down",
                    Modifier::Super => "command down",
                })
                .collect();
            format!(" using {{{}}}", names.join(", "))
        };
        match code {
            Some(code) => format!("tell application \"System Events\" to key code {code}{using}"),
            None => {
                let escaped = self.key.replace('"', "\\\"");
                format!("tell application \"System Events\" to keystroke \"{escaped}\"{using}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceHandle {
    pub id: u64,
    pub target: String,
    pub pid: Option<u32>,
}

pub trait InteractionController: Send + Sync {
    fn open_surface(&self, target: &str) -> Result<SurfaceHandle>;
    fn focus(&self, handle: &SurfaceHandle, method: FocusMethod) -> Result<()>;
    fn screen_size(&self) -> Result<(u32, u32)>;
    fn move_pointer(&self, x: u32, y: u32) -> Result<()>;
    fn move_and_click(&self, region: &Region) -> Result<()>;
    fn press_key(&self, chord: &KeyChord) -> Result<()>;
    fn capture(&self) -> Result<DynamicImage>;
    fn close_surface(&self, handle: SurfaceHandle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Linux,
    MacOs,
    Unsupported,
}

impl Platform {
    fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unsupported
        }
    }
}

/// Drives the desktop through OS command-line tools: xdotool and a screenshot
/// tool on Linux, osascript/cliclick/screencapture on macOS.
#[derive(Debug)]
pub struct CommandController {
    browser_command: Vec<String>,
    window_class: Option<String>,
    close_chord: KeyChord,
    capture_scale: f64,
    timeout: Duration,
    capture_dir: PathBuf,
    platform: Platform,
    next_id: AtomicU64,
}

impl CommandController {
    pub fn new(config: &ControllerConfig, capture_dir: PathBuf) -> Result<Self> {
        let close_chord = config
            .close_key
            .parse()
            .with_context(|| format!("invalid close_key: {}", config.close_key))?;
        Ok(Self {
            browser_command: config.browser_command.clone(),
            window_class: config.window_class.clone(),
            close_chord,
            capture_scale: if config.capture_scale > 0.0 {
                config.capture_scale
            } else {
                1.0
            },
            timeout: Duration::from_millis(config.command_timeout_ms.max(50)),
            capture_dir,
            platform: Platform::current(),
            next_id: AtomicU64::new(1),
        })
    }

    fn unsupported(&self, operation: &str) -> anyhow::Error {
        anyhow!("unsupported_platform: {operation} requires Linux (xdotool) or macOS")
    }

    fn xdotool(&self, args: &[String]) -> Result<String> {
        run_checked("xdotool", args, self.timeout, 2)
    }

    fn osascript(&self, script: &str) -> Result<String> {
        run_checked("osascript", &["-e".to_string(), script.to_string()], self.timeout, 2)
    }

    fn to_pointer(&self, x: u32, y: u32) -> (u32, u32) {
        to_pointer_space(x, y, self.capture_scale)
    }

    fn capture_path(&self) -> PathBuf {
        let ts = Utc::now().format("%Y%m%d-%H%M%S");
        let rand = rand::thread_rng().gen_range(1000..9999);
        self.capture_dir
            .join(format!("screen-{ts}-{}-{rand}.png", std::process::id()))
    }

    fn capture_to(&self, path: &Path) -> Result<()> {
        let out = path.display().to_string();
        let timeout = self.timeout.max(Duration::from_secs(5));
        match self.platform {
            Platform::MacOs => {
                run_checked("screencapture", &["-x".to_string(), out], timeout, 1)?;
            }
            Platform::Linux => {
                let attempts: [(&str, Vec<String>); 3] = [
                    ("grim", vec![out.clone()]),
                    (
                        "import",
                        vec!["-window".to_string(), "root".to_string(), out.clone()],
                    ),
                    ("scrot", vec!["-o".to_string(), out.clone()]),
                ];
                let (tool, args) = attempts
                    .into_iter()
                    .find(|(tool, _)| command_exists(tool))
                    .ok_or_else(|| anyhow!("no screen capture tool found (grim, import, scrot)"))?;
                run_checked(tool, &args, timeout, 1)?;
            }
            Platform::Unsupported => return Err(self.unsupported("screen capture")),
        }
        Ok(())
    }
}

impl InteractionController for CommandController {
    fn open_surface(&self, target: &str) -> Result<SurfaceHandle> {
        let argv = expand_url(&self.browser_command, target);
        let pid = spawn_detached(&argv).context("failed to open browser surface")?;
        Ok(SurfaceHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            target: target.to_string(),
            pid: Some(pid),
        })
    }

    fn focus(&self, _handle: &SurfaceHandle, method: FocusMethod) -> Result<()> {
        match (self.platform, method) {
            (_, FocusMethod::None) => Ok(()),
            (Platform::Linux, FocusMethod::Activate) => {
                let class = self
                    .window_class
                    .as_deref()
                    .ok_or_else(|| anyhow!("focus=activate needs controller.window_class"))?;
                self.xdotool(&[
                    "search".to_string(),
                    "--onlyvisible".to_string(),
                    "--class".to_string(),
                    class.to_string(),
                    "windowactivate".to_string(),
                ])
                .map(|_| ())
            }
            (Platform::Linux, FocusMethod::AltTab) => self
                .xdotool(&["key".to_string(), "alt+Tab".to_string()])
                .map(|_| ()),
            (Platform::MacOs, FocusMethod::Activate) => {
                let app = self.window_class.as_deref().unwrap_or("Google Chrome");
                let escaped = app.replace('"', "\\\"");
                self.osascript(&format!("tell application \"{escaped}\" to activate"))
                    .map(|_| ())
            }
            (Platform::MacOs, FocusMethod::AltTab) => self
                .osascript("tell application \"System Events\" to key code 48 using {command down}")
                .map(|_| ()),
            (Platform::Unsupported, _) => Err(self.unsupported("focus")),
        }
    }

    fn screen_size(&self) -> Result<(u32, u32)> {
        match self.platform {
            Platform::Linux => {
                let raw = self.xdotool(&["getdisplaygeometry".to_string()])?;
                parse_dimensions(&raw).ok_or_else(|| anyhow!("unexpected geometry output: {raw}"))
            }
            Platform::MacOs => {
                let raw = self.osascript(
                    "tell application \"Finder\" to get bounds of window of desktop",
                )?;
                parse_dimensions(&raw).ok_or_else(|| anyhow!("unexpected bounds output: {raw}"))
            }
            Platform::Unsupported => Err(self.unsupported("screen size")),
        }
    }

    fn move_pointer(&self, x: u32, y: u32) -> Result<()> {
        match self.platform {
            Platform::Linux => self
                .xdotool(&["mousemove".to_string(), x.to_string(), y.to_string()])
                .map(|_| ()),
            Platform::MacOs => run_checked("cliclick", &[format!("m:{x},{y}")], self.timeout, 1)
                .map(|_| ()),
            Platform::Unsupported => Err(self.unsupported("pointer movement")),
        }
    }

    fn move_and_click(&self, region: &Region) -> Result<()> {
        let (cx, cy) = region.center();
        let (x, y) = self.to_pointer(cx, cy);
        match self.platform {
            Platform::Linux => self
                .xdotool(&[
                    "mousemove".to_string(),
                    "--sync".to_string(),
                    x.to_string(),
                    y.to_string(),
                    "click".to_string(),
                    "1".to_string(),
                ])
                .map(|_| ()),
            Platform::MacOs => run_checked(
                "cliclick",
                &[format!("m:{x},{y}"), format!("c:{x},{y}")],
                self.timeout,
                1,
            )
            .map(|_| ()),
            Platform::Unsupported => Err(self.unsupported("click")),
        }
    }

    fn press_key(&self, chord: &KeyChord) -> Result<()> {
        match self.platform {
            Platform::Linux => self
                .xdotool(&["key".to_string(), chord.xdotool_spec()])
                .map(|_| ()),
            Platform::MacOs => self.osascript(&chord.applescript()).map(|_| ()),
            Platform::Unsupported => Err(self.unsupported("key press")),
        }
    }

    fn capture(&self) -> Result<DynamicImage> {
        fs::create_dir_all(&self.capture_dir).with_context(|| {
            format!("failed to create capture dir: {}", self.capture_dir.display())
        })?;
        let path = self.capture_path();
        self.capture_to(&path)?;
        let frame = image::open(&path)
            .with_context(|| format!("failed to read capture image: {}", path.display()));
        let _ = fs::remove_file(&path);
        frame
    }

    fn close_surface(&self, handle: SurfaceHandle) -> Result<()> {
        debug!(surface = handle.id, pid = ?handle.pid, target = %handle.target, "closing surface");
        self.press_key(&self.close_chord)
            .context("failed to close surface")
    }
}

fn expand_url(template: &[String], url: &str) -> Vec<String> {
    template
        .iter()
        .map(|part| part.replace("{url}", url))
        .collect()
}

fn to_pointer_space(x: u32, y: u32, scale: f64) -> (u32, u32) {
    (
        (f64::from(x) / scale).round() as u32,
        (f64::from(y) / scale).round() as u32,
    )
}

/// Reads the last two integers of `1920 1080` or `0, 0, 1440, 900`.
fn parse_dimensions(raw: &str) -> Option<(u32, u32)> {
    let numbers: Vec<u32> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect();
    match numbers.as_slice() {
        [.., w, h] => Some((*w, *h)),
        _ => None,
    }
}
