use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::EventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowBuilder;

use crate::encoder::EncoderConfig;
use crate::engine::Engine;

pub struct PlayArgs {
    pub images: Vec<PathBuf>,
    pub clip_duration_sec: f64,
    pub crossfade_sec: f64,
    pub export: EncoderConfig,
}

/// Interactive preview window. Space toggles playback, S stops, E starts an
/// export of the current timeline, C cancels it, Escape quits.
pub fn run(args: PlayArgs) -> Result<()> {
    let event_loop = EventLoop::new().context("failed creating event loop")?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("fadereel")
            .with_inner_size(PhysicalSize::new(960, 540))
            .build(&event_loop)
            .context("failed creating window")?,
    );

    let engine = Engine::new();
    engine.init_surface(window.clone())?;
    let size = window.inner_size();
    engine.change_surface(size.width, size.height);
    engine.set_image_sequence(&args.images, args.clip_duration_sec, args.crossfade_sec)?;
    info!(
        "loaded {} image(s), timeline {:.2}s",
        args.images.len(),
        engine.timeline_duration()
    );

    let mut playing = false;
    event_loop
        .run(move |event, target| {
            let Event::WindowEvent { event, .. } = event else {
                return;
            };
            match event {
                WindowEvent::CloseRequested => {
                    engine.cancel_encoding();
                    engine.destroy_surface();
                    target.exit();
                }
                WindowEvent::Resized(size) => {
                    engine.change_surface(size.width, size.height);
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            logical_key,
                            state: ElementState::Pressed,
                            repeat: false,
                            ..
                        },
                    ..
                } => match logical_key {
                    Key::Named(NamedKey::Space) => {
                        if playing {
                            engine.preview_pause();
                        } else {
                            engine.preview_play();
                        }
                        playing = !playing;
                    }
                    Key::Named(NamedKey::Escape) => {
                        engine.cancel_encoding();
                        engine.destroy_surface();
                        target.exit();
                    }
                    Key::Character(text) => match text.as_str() {
                        "s" | "S" => {
                            engine.preview_stop();
                            playing = false;
                        }
                        "e" | "E" => {
                            if engine.is_encoding() {
                                warn!(
                                    "export at {:.0}%, press C to cancel",
                                    engine.encoding_progress() * 100.0
                                );
                            } else {
                                engine.start_encoding(args.export.clone());
                            }
                        }
                        "c" | "C" => engine.cancel_encoding(),
                        _ => {}
                    },
                    _ => {}
                },
                _ => {}
            }
        })
        .context("event loop failed")?;
    Ok(())
}
