//! Synthetic source (`stub://`) for demos and tests.
//!
//! Produces a moving RGB test pattern at a fixed rate. Query parameters tune it:
//! `stub://front_camera?width=320&height=240&fps=15&frames=300`.
//! With `frames` set, the stream ends cleanly after that many pictures, which
//! exercises the reconnection path without a real camera.

use std::time::{Duration, Instant};

use super::{InputInfo, MediaBackend, MediaInput, OpenOptions, Picture};
use crate::error::StreamError;
use crate::source::{StreamSource, SYNTHETIC_SCHEME};

/// Settings parsed from a `stub://` address.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// End the stream after this many frames.
    pub frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: 640,
            height: 480,
            fps: 10,
            frames: None,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(address: &str) -> Result<Self, StreamError> {
        let rest = address.strip_prefix(SYNTHETIC_SCHEME).ok_or_else(|| {
            StreamError::validation(format!("not a synthetic address: {address}"))
        })?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self {
            name: if name.is_empty() {
                Self::default().name
            } else {
                name.to_string()
            },
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let parse_u32 = |value: &str| {
                value.parse::<u32>().map_err(|_| {
                    StreamError::validation(format!("synthetic {key} must be an integer"))
                })
            };
            match key {
                "width" => config.width = parse_u32(value)?,
                "height" => config.height = parse_u32(value)?,
                "fps" => config.fps = parse_u32(value)?,
                "frames" => {
                    config.frames = Some(value.parse::<u64>().map_err(|_| {
                        StreamError::validation("synthetic frames must be an integer")
                    })?)
                }
                other => {
                    return Err(StreamError::validation(format!(
                        "unknown synthetic parameter: {other}"
                    )))
                }
            }
        }

        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(StreamError::validation(
                "synthetic width, height and fps must be non-zero",
            ));
        }
        Ok(config)
    }
}

/// Backend for `stub://` addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticBackend;

impl MediaBackend for SyntheticBackend {
    fn open(
        &self,
        source: &StreamSource,
        _options: &OpenOptions,
    ) -> Result<Box<dyn MediaInput>, StreamError> {
        let config = SyntheticConfig::parse(source.address())?;
        log::info!("synthetic source: connected to {}", config.name);
        Ok(Box::new(SyntheticInput::new(config)))
    }
}

struct SyntheticInput {
    config: SyntheticConfig,
    frame_count: u64,
    /// Simulated scene state, shifted every 50 frames.
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticInput {
    fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.config.fps))
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let len = crate::frame::rgb24_len(self.config.width, self.config.height);
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl MediaInput for SyntheticInput {
    fn info(&self) -> InputInfo {
        InputInfo {
            codec: "rawvideo".to_string(),
            frame_rate: f64::from(self.config.fps),
        }
    }

    fn read(&mut self) -> Result<Option<Picture>, StreamError> {
        if self
            .config
            .frames
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Err(StreamError::disconnected(format!(
                "synthetic stream {} ended after {} frames",
                self.config.name, self.frame_count
            )));
        }

        // Wait for the next frame slot, bounded to one frame interval per read.
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.frame_interval());

        self.frame_count += 1;
        Ok(Some(Picture {
            width: self.config.width,
            height: self.config.height,
            pixels: self.generate_pixels(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_query_parameters() {
        let config =
            SyntheticConfig::parse("stub://lobby?width=32&height=16&fps=50&frames=3").expect("parse");
        assert_eq!(config.name, "lobby");
        assert_eq!((config.width, config.height, config.fps), (32, 16, 50));
        assert_eq!(config.frames, Some(3));

        assert_eq!(
            SyntheticConfig::parse("stub://").expect("parse"),
            SyntheticConfig::default()
        );
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SyntheticConfig::parse("stub://x?fps=0").is_err());
        assert!(SyntheticConfig::parse("stub://x?width=wide").is_err());
        assert!(SyntheticConfig::parse("stub://x?color=red").is_err());
        assert!(SyntheticConfig::parse("rtsp://x").is_err());
    }

    #[test]
    fn produces_rgb_frames_then_ends() {
        let source = StreamSource::rtsp("stub://test?width=8&height=4&fps=200&frames=2");
        let mut input = SyntheticBackend
            .open(&source, &OpenOptions::default())
            .expect("open");
        assert_eq!(input.info().frame_rate, 200.0);

        let first = input.read().expect("read").expect("picture");
        assert_eq!((first.width, first.height), (8, 4));
        assert_eq!(first.pixels.len(), 8 * 4 * 3);
        let second = input.read().expect("read").expect("picture");
        assert_ne!(first.pixels, second.pixels);

        assert_eq!(input.read().unwrap_err().kind, ErrorKind::Disconnected);
    }
}
