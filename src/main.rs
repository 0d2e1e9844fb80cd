// =============================================================================
// HELLO TRIANGLE - Vulkan bring-up, one triangle, swap-chain recreation
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          ├── StageSequencer (what exists, in which order)       │
// │          └── VulkanContext  (the objects each stage owns)       │
// └─────────────────────────────────────────────────────────────────┘
//
// The bring-up can stop at any stage (`[vulkan] final_stage` in config.toml);
// only a full bring-up draws.
//
// =============================================================================

mod backend;
mod config;

use anyhow::{Context, Result};
use backend::{FrameStatus, Renderer};
use config::Config;
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, source) = Config::load();

    init_logging(&config)?;
    log::info!("Starting hello-triangle");
    source.report(&config);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.resizable { "resizable" } else { "fixed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop failed")?;

    // Returned errors are printed by the runtime, not logged here
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize env_logger. `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let env = Env::default().default_filter_or(config.debug.log_level.as_str());
    let mut builder = Builder::from_env(env);

    if let Some(path) = &config.debug.log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file: {:?}", path))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Counts presented frames and reports a rate once per interval
struct FpsCounter {
    interval: Duration,
    frames: u32,
    since: Instant,
}

impl FpsCounter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            frames: 0,
            since: Instant::now(),
        }
    }

    /// Count a frame presented at `now`, returning the rate when an interval has elapsed
    fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.interval {
            return None;
        }

        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.since = now;
        Some(fps)
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the window
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    fps: FpsCounter,
    /// First unrecoverable error, returned from `main`
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            fps: FpsCounter::new(Duration::from_secs(1)),
            fatal: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .context("Failed to create window")?,
        );

        let renderer = Renderer::new(window.clone(), self.config.renderer_settings())
            .context("Failed to initialize Vulkan")?;

        match renderer.reached() {
            Some(stage) if !renderer.can_present() => {
                log::info!(
                    "Bring-up stopped after {} (final_stage = {}); nothing to draw",
                    stage,
                    renderer.final_stage()
                );
                event_loop.set_control_flow(ControlFlow::Wait);
            }
            _ => event_loop.set_control_flow(ControlFlow::Poll),
        }

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &self.renderer {
            if let Err(e) = renderer.wait_idle() {
                log::warn!("Failed to wait for device: {:?}", e);
            }
        }
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match renderer.draw_frame() {
            Ok(FrameStatus::Presented) => self.update_fps(),
            Ok(FrameStatus::Rebuilt | FrameStatus::Minimized | FrameStatus::Idle) => {}
            Err(e) => self.fail(event_loop, e.context("Failed to draw frame")),
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        if let (Some(fps), Some(window)) = (self.fps.tick(Instant::now()), &self.window) {
            let frame_ms = if fps > 0.0 { 1000.0 / fps } else { 0.0 };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.config.window.title, fps, frame_ms
            ));
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.mark_resized();
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            _ => {}
        }
    }

    /// Keep frames coming while there is something to present
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        let presenting = self.renderer.as_ref().is_some_and(Renderer::can_present);
        if let (true, Some(window)) = (presenting, &self.window) {
            window.request_redraw();
        }
    }

    /// Tear Vulkan down while the window is still alive
    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_is_reported_once_per_interval() {
        let start = Instant::now();
        let mut counter = FpsCounter {
            interval: Duration::from_secs(1),
            frames: 0,
            since: start,
        };

        for i in 1..60 {
            assert_eq!(counter.tick(start + Duration::from_millis(i * 10)), None);
        }

        let fps = counter.tick(start + Duration::from_secs(2)).unwrap();
        assert!((fps - 30.0).abs() < 0.01);
        assert_eq!(counter.frames, 0);
    }
}
