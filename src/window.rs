// Window - the platform collaborator the renderer needs
//
// winit drives the OS window; instead of handing control to `run_app`, the
// event loop is pumped once per frame so the game keeps its own loop:
//
//   while window.poll() {
//       ... read input, draw ...
//   }
//
// Also provides the instance extensions and VkSurfaceKHR for the window.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::collections::HashSet;
use std::ffi::CStr;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, WindowAttributes, WindowId},
};

use crate::backend::VulkanDevice;
use crate::config::WindowConfig;

/// Pumps allowed for the platform to deliver `Resumed` and create the window
const WINDOW_CREATE_PUMPS: u32 = 100;

pub struct Window {
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl Window {
    /// Open a window as described by `config`
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;

        let mut attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);

        if config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let mut state = WindowState::new(attributes, config.fullscreen);

        // Desktop platforms deliver Resumed on the first pumps
        for _ in 0..WINDOW_CREATE_PUMPS {
            let status = event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut state);
            if let Some(e) = state.creation_error.take() {
                return Err(e);
            }
            if state.window.is_some() {
                break;
            }
            if let PumpStatus::Exit(code) = status {
                anyhow::bail!("Event loop exited with code {} before the window opened", code);
            }
        }

        let window = state.window.as_ref().context("Window was not created")?;
        let size = window.inner_size();
        state.input.size = (size.width, size.height);

        log::info!(
            "Window created: {}x{} ({})",
            size.width,
            size.height,
            if config.fullscreen { "fullscreen" } else { "windowed" }
        );

        Ok(Self { state, event_loop })
    }

    fn winit_window(&self) -> Result<&winit::window::Window> {
        self.state.window.as_ref().context("Window not created")
    }

    /// Process pending events. Returns false once the window should close.
    pub fn poll(&mut self) -> bool {
        self.state.input.begin_poll();
        if let PumpStatus::Exit(_) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state)
        {
            self.state.open = false;
        }
        self.state.open
    }

    /// Ask the loop to end; the next `poll` returns false
    pub fn close(&mut self) {
        self.state.open = false;
    }

    pub fn width(&self) -> u32 {
        self.state.input.size.0
    }

    pub fn height(&self) -> u32 {
        self.state.input.size.1
    }

    /// Cursor position in physical pixels from the top-left corner
    pub fn mouse_x(&self) -> f32 {
        self.state.input.mouse.0 as f32
    }

    pub fn mouse_y(&self) -> f32 {
        self.state.input.mouse.1 as f32
    }

    /// Cursor movement during the last poll
    pub fn delta_mouse(&self) -> (f32, f32) {
        let (dx, dy) = self.state.input.mouse_delta;
        (dx as f32, dy as f32)
    }

    pub fn left_clicking(&self) -> bool {
        self.state.input.left_button
    }

    pub fn is_key_down(&self, key: KeyCode) -> bool {
        self.state.input.keys.contains(&key)
    }

    /// Latest size change since the previous call, if any
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        self.state.input.resized.take()
    }

    pub fn set_title(&self, title: &str) {
        if let Some(window) = &self.state.window {
            window.set_title(title);
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.state.fullscreen
    }

    /// Switch between borderless fullscreen and windowed. The resulting
    /// resize arrives through `take_resize`.
    pub fn toggle_fullscreen(&mut self) {
        let Some(window) = &self.state.window else {
            return;
        };

        self.state.fullscreen = !self.state.fullscreen;
        if self.state.fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
    }

    /// Instance extensions needed to present to this window
    pub fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
        let display = self
            .winit_window()?
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        surface_extensions(display)
    }

    /// Create a presentable surface for this window on `device`'s instance.
    ///
    /// The window must outlive the surface.
    pub fn create_surface(&self, device: &VulkanDevice) -> Result<vk::SurfaceKHR> {
        let window = self.winit_window()?;
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let entry = device.entry();
        let instance = &device.instance;

        let surface = match (display_handle, window_handle) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance = handle.hinstance.map_or(0, |h| h.get());
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance as vk::HINSTANCE)
                    .hwnd(handle.hwnd.get() as vk::HWND);
                let loader = khr::Win32Surface::new(entry, instance);
                unsafe { loader.create_win32_surface(&create_info, None) }
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display.display.context("Xlib display handle is null")?;
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.as_ptr().cast())
                    .window(handle.window);
                let loader = khr::XlibSurface::new(entry, instance);
                unsafe { loader.create_xlib_surface(&create_info, None) }
            }
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                let connection = display.connection.context("XCB connection is null")?;
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection.as_ptr().cast())
                    .window(handle.window.get());
                let loader = khr::XcbSurface::new(entry, instance);
                unsafe { loader.create_xcb_surface(&create_info, None) }
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr().cast())
                    .surface(handle.surface.as_ptr().cast());
                let loader = khr::WaylandSurface::new(entry, instance);
                unsafe { loader.create_wayland_surface(&create_info, None) }
            }
            (display, window) => {
                anyhow::bail!("Unsupported window handle pair: {:?} / {:?}", display, window)
            }
        };

        surface.context("Failed to create window surface")
    }
}

/// `VK_KHR_surface` plus the platform surface extension for `display`
pub fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display server: {:?}", other),
    };
    Ok(vec![khr::Surface::name(), platform])
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

struct WindowState {
    /// Taken when the window is created on the first Resumed
    attributes: Option<WindowAttributes>,
    window: Option<winit::window::Window>,
    creation_error: Option<anyhow::Error>,
    open: bool,
    fullscreen: bool,
    input: InputState,
}

impl WindowState {
    fn new(attributes: WindowAttributes, fullscreen: bool) -> Self {
        Self {
            attributes: Some(attributes),
            window: None,
            creation_error: None,
            open: true,
            fullscreen,
            input: InputState::default(),
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(attributes) = self.attributes.take() else {
            return;
        };

        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(window),
            Err(e) => {
                self.creation_error = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.open = false;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.input.resize(size.width, size.height);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input.cursor_moved(position.x, position.y);
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.input.left_button = state == ElementState::Pressed;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.input.key(code, event.state.is_pressed());
                }
            }
            // Releases that happen elsewhere never reach us
            WindowEvent::Focused(false) => self.input.focus_lost(),
            _ => {}
        }
    }
}

/// Input and size state accumulated from window events
#[derive(Debug, Default)]
struct InputState {
    size: (u32, u32),
    resized: Option<(u32, u32)>,
    mouse: (f64, f64),
    mouse_delta: (f64, f64),
    left_button: bool,
    keys: HashSet<KeyCode>,
}

impl InputState {
    fn begin_poll(&mut self) {
        self.mouse_delta = (0.0, 0.0);
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        self.resized = Some((width, height));
    }

    fn cursor_moved(&mut self, x: f64, y: f64) {
        self.mouse_delta.0 += x - self.mouse.0;
        self.mouse_delta.1 += y - self.mouse.1;
        self.mouse = (x, y);
    }

    fn key(&mut self, code: KeyCode, pressed: bool) {
        if pressed {
            self.keys.insert(code);
        } else {
            self.keys.remove(&code);
        }
    }

    fn focus_lost(&mut self) {
        self.keys.clear();
        self.left_button = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{
        AppKitDisplayHandle, WaylandDisplayHandle, WindowsDisplayHandle, XcbDisplayHandle,
        XlibDisplayHandle,
    };
    use std::ptr::NonNull;

    fn names(display: RawDisplayHandle) -> Vec<String> {
        surface_extensions(display)
            .unwrap()
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn surface_extension_per_display_server() {
        assert_eq!(
            names(RawDisplayHandle::Windows(WindowsDisplayHandle::new())),
            ["VK_KHR_surface", "VK_KHR_win32_surface"]
        );
        assert_eq!(
            names(RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0))),
            ["VK_KHR_surface", "VK_KHR_xlib_surface"]
        );
        assert_eq!(
            names(RawDisplayHandle::Xcb(XcbDisplayHandle::new(None, 0))),
            ["VK_KHR_surface", "VK_KHR_xcb_surface"]
        );

        let mut display = 0u8;
        let wayland = WaylandDisplayHandle::new(NonNull::from(&mut display).cast());
        assert_eq!(
            names(RawDisplayHandle::Wayland(wayland)),
            ["VK_KHR_surface", "VK_KHR_wayland_surface"]
        );
    }

    #[test]
    fn unsupported_display_server() {
        let err = surface_extensions(RawDisplayHandle::AppKit(AppKitDisplayHandle::new()))
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn mouse_delta_accumulates_within_a_poll() {
        let mut input = InputState::default();
        input.cursor_moved(10.0, 10.0);
        input.begin_poll();

        input.cursor_moved(15.0, 8.0);
        input.cursor_moved(20.0, 4.0);
        assert_eq!(input.mouse, (20.0, 4.0));
        assert_eq!(input.mouse_delta, (10.0, -6.0));

        input.begin_poll();
        assert_eq!(input.mouse_delta, (0.0, 0.0));
    }

    #[test]
    fn keys_track_press_and_release() {
        let mut input = InputState::default();
        input.key(KeyCode::KeyW, true);
        input.key(KeyCode::Space, true);
        input.key(KeyCode::KeyW, false);

        assert!(input.keys.contains(&KeyCode::Space));
        assert!(!input.keys.contains(&KeyCode::KeyW));
    }

    #[test]
    fn focus_loss_releases_everything() {
        let mut input = InputState::default();
        input.key(KeyCode::Escape, true);
        input.left_button = true;

        input.focus_lost();
        assert!(input.keys.is_empty());
        assert!(!input.left_button);
    }

    #[test]
    fn latest_resize_wins() {
        let mut input = InputState::default();
        input.resize(800, 600);
        input.resize(1024, 768);

        assert_eq!(input.size, (1024, 768));
        assert_eq!(input.resized.take(), Some((1024, 768)));
        assert_eq!(input.resized, None);
    }
}
