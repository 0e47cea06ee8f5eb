// =============================================================================
// RAY TRACING BOOTSTRAP - Vulkan setup for a hardware ray tracer
// =============================================================================
//
// Brings up everything a ray tracing renderer needs, then idles in the event
// loop until the window is closed. Nothing is drawn yet.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── RenderContext                                            │
// │          └── Instance + Surface + Device (ray tracing features) │
// │                └── Swapchain + Storage image                    │
// │                      └── Mesh buffers -> BLAS -> TLAS           │
// └─────────────────────────────────────────────────────────────────┘
//
// LOOP:
// 1. Pump window events into InputState
// 2. Run the update step (quit key check)
// 3. Block until the next event
//
// =============================================================================

mod backend;
mod config;
mod context;
mod error;
mod input;
mod scene;

use anyhow::{Context, Result};
use backend::swapchain;
use config::Config;
use context::RenderContext;
use input::{Action, InputState};
use std::fs::File;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{CursorGrabMode, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, config_error) = Config::load();

    init_logging(&config);
    log::info!("Starting ray tracing bootstrap");
    match config_error {
        Some(e) => log::warn!("Failed to load config.toml: {:#}. Using defaults.", e),
        None => log::info!("Loaded configuration from config.toml"),
    }
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.resizable { "resizable" } else { "fixed" }
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    // Nothing animates, so sleep until the OS has something for us
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Bootstrap failures are reported after the loop so the exit code says so
    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally piped to the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    // RUST_LOG still wins over config.toml
    builder.parse_default_env();

    let mut file_error = None;
    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!(
            "Could not open log file {}: {}. Logging to stderr.",
            config.debug.log_file,
            e
        );
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The context holds GPU objects
/// that reference the window's surface, so it goes first.
struct App {
    context: Option<RenderContext>,
    window: Option<Arc<Window>>,
    input: InputState,
    quit_key: Option<KeyCode>,
    config: Config,
    /// First fatal error, returned from main once the loop has exited
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let quit_key = input::parse_key_code(&config.controls.quit_key);
        if quit_key.is_none() {
            log::warn!(
                "Unknown quit key {:?}, only closing the window will exit",
                config.controls.quit_key
            );
        }

        Self {
            context: None,
            window: None,
            input: InputState::default(),
            quit_key,
            config,
            error: None,
        }
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(self.config.window.resizable);

        let window = event_loop
            .create_window(window_attributes)
            .context("Failed to create window")?;

        if self.config.window.capture_cursor {
            capture_cursor(&window);
        }

        Ok(Arc::new(window))
    }

    /// Log the failure, keep it for main and stop the loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }
}

/// Hide the cursor and keep it in the window. Platforms without pointer
/// lock get a confined cursor instead.
fn capture_cursor(window: &Window) {
    let grabbed = window
        .set_cursor_grab(CursorGrabMode::Locked)
        .or_else(|_| window.set_cursor_grab(CursorGrabMode::Confined));
    if let Err(e) = grabbed {
        log::warn!("Cursor grab unavailable: {}", e);
    }
    window.set_cursor_visible(false);
}

/// Extent to rebuild the swapchain at. None when the window is fixed-size
/// or minimized, where the current swapchain stays.
fn resize_target(resizable: bool, size: PhysicalSize<u32>) -> Option<(u32, u32)> {
    (resizable && swapchain::needs_recreate(size.width, size.height))
        .then_some((size.width, size.height))
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match self.create_window(event_loop) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        };

        match RenderContext::new(window.clone(), &self.config) {
            Ok(context) => self.context = Some(context),
            Err(e) => {
                self.window = Some(window);
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                let Some((width, height)) = resize_target(self.config.window.resizable, size) else {
                    return;
                };
                let Some(context) = self.context.as_mut() else {
                    return;
                };

                if let Err(e) = context.resize(width, height) {
                    self.fail(event_loop, e.context("Failed to resize swapchain"));
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    self.input.handle_key(key, event.state);
                }
            }

            // Release events never arrive for keys let go while unfocused
            WindowEvent::Focused(false) => self.input.clear(),

            _ => {}
        }
    }

    /// Called once the pending events are handled, before the loop blocks.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if input::update(&self.input, self.quit_key) == Action::Quit {
            log::info!("Quit key pressed, exiting...");
            event_loop.exit();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        // GPU objects first, the window they present to last
        self.context = None;
        self.window = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_ignores_resize_events() {
        assert_eq!(resize_target(false, PhysicalSize::new(1024, 768)), None);
        assert_eq!(resize_target(false, PhysicalSize::new(0, 0)), None);
    }

    #[test]
    fn resizable_window_rebuilds_unless_minimized() {
        assert_eq!(
            resize_target(true, PhysicalSize::new(1024, 768)),
            Some((1024, 768))
        );
        assert_eq!(resize_target(true, PhysicalSize::new(0, 0)), None);
        assert_eq!(resize_target(true, PhysicalSize::new(0, 768)), None);
        assert_eq!(resize_target(true, PhysicalSize::new(1024, 0)), None);
    }
}
