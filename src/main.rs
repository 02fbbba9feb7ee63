//! Ember - a GPU-accelerated terminal emulator.
//!
//! Single-process architecture: one process owns the PTY, the terminal
//! state and the renderer. The terminal lives behind a mutex shared with
//! the PTY reader thread; the renderer snapshots it per frame.

use std::sync::{Arc, Mutex};
use std::thread;

use winit::application::ApplicationHandler;
use winit::event::{ElementState, Ime, KeyEvent as WinitKeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy};
use winit::keyboard::{Key as WinitKey, ModifiersState, NamedKey};
use winit::platform::modifier_supplement::KeyEventExtModifierSupplement;
use winit::window::{Window, WindowId};

use ember::config::Config;
use ember::keyboard::{Key, KeyAction, KeyEncoder, KeyEvent, Mods};
use ember::pty::Pty;
use ember::renderer::{Renderer, WindowMessage};
use ember::terminal::Terminal;

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    terminal: Arc<Mutex<Terminal>>,
    pty: Option<Arc<Pty>>,
    proxy: EventLoopProxy<WindowMessage>,
    modifiers: Mods,
    composing: bool,
    focused: bool,
}

impl App {
    fn new(proxy: EventLoopProxy<WindowMessage>) -> Self {
        let config = Config::load();
        let mut terminal = Terminal::new(80, 24, config.scrollback_lines);
        config.apply_palette(&mut terminal.palette);
        Self {
            config,
            window: None,
            renderer: None,
            terminal: Arc::new(Mutex::new(terminal)),
            pty: None,
            proxy,
            modifiers: Mods::empty(),
            composing: false,
            focused: true,
        }
    }

    fn create_window(&mut self, event_loop: &ActiveEventLoop) {
        let window = match event_loop
            .create_window(Window::default_attributes().with_title("ember"))
        {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("failed to create window: {err}");
                event_loop.exit();
                return;
            }
        };
        window.set_ime_allowed(true);

        let renderer = match pollster::block_on(Renderer::new(
            window.clone(),
            &self.config,
            self.proxy.clone(),
        )) {
            Ok(renderer) => renderer,
            Err(err) => {
                log::error!("renderer initialization failed: {err}");
                event_loop.exit();
                return;
            }
        };

        let (cols, rows) = renderer.grid_size();
        self.terminal.lock().unwrap().resize(cols, rows);

        let pty = match Pty::spawn(self.config.shell.as_deref(), cols as u16, rows as u16) {
            Ok(pty) => Arc::new(pty),
            Err(err) => {
                log::error!("failed to spawn shell: {err}");
                event_loop.exit();
                return;
            }
        };

        // Reader thread: shell output feeds the terminal and schedules a
        // redraw. Exits when the child hangs up.
        {
            let pty = pty.clone();
            let terminal = self.terminal.clone();
            let window = window.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 64 * 1024];
                loop {
                    match pty.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            terminal.lock().unwrap().feed(&buf[..n]);
                            window.request_redraw();
                        }
                        Err(err) => {
                            log::info!("pty reader stopping: {err}");
                            break;
                        }
                    }
                }
            });
        }

        self.window = Some(window);
        self.renderer = Some(renderer);
        self.pty = Some(pty);
    }

    /// Recomputes the grid from the surface and cell geometry and pushes
    /// it to the terminal and the PTY.
    fn sync_grid(&mut self) {
        let Some(renderer) = &self.renderer else { return };
        let (cols, rows) = renderer.grid_size();
        self.terminal.lock().unwrap().resize(cols, rows);
        if let Some(pty) = &self.pty {
            if let Err(err) = pty.resize(cols as u16, rows as u16) {
                log::warn!("pty resize failed: {err}");
            }
        }
    }

    fn handle_key(&mut self, event: WinitKeyEvent) {
        let Some(pty) = &self.pty else { return };

        let action = match event.state {
            ElementState::Pressed if event.repeat => KeyAction::Repeat,
            ElementState::Pressed => KeyAction::Press,
            ElementState::Released => KeyAction::Release,
        };
        let unshifted = match event.key_without_modifiers() {
            WinitKey::Character(s) => s.chars().next().map(|c| c as u32).unwrap_or(0),
            _ => 0,
        };
        let text = event
            .text_with_all_modifiers()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let key = map_key(&event.key_without_modifiers());

        let key_event = KeyEvent {
            key,
            action,
            mods: self.modifiers,
            utf8: &text,
            unshifted_codepoint: unshifted,
            composing: self.composing,
        };
        let state = {
            let mut term = self.terminal.lock().unwrap();
            if action != KeyAction::Release {
                // Typing snaps the viewport back to the live screen.
                term.scroll_viewport(isize::MIN + 1);
            }
            term.encoder_state()
        };

        let mut buf = [0u8; 128];
        match KeyEncoder::new(&key_event, state).encode(&mut buf) {
            Ok(bytes) if !bytes.is_empty() => {
                if let Err(err) = pty.write_all(bytes) {
                    log::warn!("pty write failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => log::error!("key encoding failed: {err}"),
        }
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

/// Maps a winit logical key (without modifiers) to the encoder's key enum.
fn map_key(key: &WinitKey) -> Key {
    match key {
        WinitKey::Character(s) => s.chars().next().map(Key::Char).unwrap_or(Key::Unidentified),
        WinitKey::Named(named) => match named {
            NamedKey::Enter => Key::Enter,
            NamedKey::Tab => Key::Tab,
            NamedKey::Backspace => Key::Backspace,
            NamedKey::Escape => Key::Escape,
            NamedKey::Space => Key::Char(' '),
            NamedKey::Insert => Key::Insert,
            NamedKey::Delete => Key::Delete,
            NamedKey::Home => Key::Home,
            NamedKey::End => Key::End,
            NamedKey::PageUp => Key::PageUp,
            NamedKey::PageDown => Key::PageDown,
            NamedKey::ArrowLeft => Key::Left,
            NamedKey::ArrowRight => Key::Right,
            NamedKey::ArrowUp => Key::Up,
            NamedKey::ArrowDown => Key::Down,
            NamedKey::F1 => Key::F1,
            NamedKey::F2 => Key::F2,
            NamedKey::F3 => Key::F3,
            NamedKey::F4 => Key::F4,
            NamedKey::F5 => Key::F5,
            NamedKey::F6 => Key::F6,
            NamedKey::F7 => Key::F7,
            NamedKey::F8 => Key::F8,
            NamedKey::F9 => Key::F9,
            NamedKey::F10 => Key::F10,
            NamedKey::F11 => Key::F11,
            NamedKey::F12 => Key::F12,
            NamedKey::CapsLock => Key::CapsLock,
            NamedKey::ScrollLock => Key::ScrollLock,
            NamedKey::NumLock => Key::NumLock,
            NamedKey::PrintScreen => Key::PrintScreen,
            NamedKey::Pause => Key::Pause,
            NamedKey::ContextMenu => Key::Menu,
            NamedKey::Shift => Key::LeftShift,
            NamedKey::Control => Key::LeftControl,
            NamedKey::Alt => Key::LeftAlt,
            NamedKey::Super | NamedKey::Meta => Key::LeftSuper,
            NamedKey::AltGraph => Key::IsoLevel3Shift,
            NamedKey::MediaPlay => Key::MediaPlay,
            NamedKey::MediaPause => Key::MediaPause,
            NamedKey::MediaPlayPause => Key::MediaPlayPause,
            NamedKey::MediaStop => Key::MediaStop,
            NamedKey::MediaTrackNext => Key::MediaTrackNext,
            NamedKey::MediaTrackPrevious => Key::MediaTrackPrevious,
            NamedKey::AudioVolumeDown => Key::LowerVolume,
            NamedKey::AudioVolumeUp => Key::RaiseVolume,
            NamedKey::AudioVolumeMute => Key::MuteVolume,
            _ => Key::Unidentified,
        },
        _ => Key::Unidentified,
    }
}

fn mods_from(state: ModifiersState) -> Mods {
    let mut mods = Mods::empty();
    if state.shift_key() {
        mods |= Mods::SHIFT;
    }
    if state.alt_key() {
        mods |= Mods::ALT;
    }
    if state.control_key() {
        mods |= Mods::CTRL;
    }
    if state.super_key() {
        mods |= Mods::SUPER;
    }
    mods
}

impl ApplicationHandler<WindowMessage> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if self.window.is_none() {
            self.create_window(event_loop);
        }
    }

    fn user_event(&mut self, _event_loop: &ActiveEventLoop, event: WindowMessage) {
        match event {
            WindowMessage::CellSize { width, height } => {
                log::debug!("cell size changed to {width}x{height}");
                self.sync_grid();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(renderer) = &mut self.renderer {
                    renderer.resize(size.width, size.height);
                }
                self.sync_grid();
            }
            WindowEvent::Focused(focused) => {
                self.focused = focused;
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            WindowEvent::ModifiersChanged(modifiers) => {
                self.modifiers = mods_from(modifiers.state());
            }
            WindowEvent::Ime(ime) => match ime {
                Ime::Preedit(text, _) => self.composing = !text.is_empty(),
                Ime::Commit(text) => {
                    self.composing = false;
                    if let Some(pty) = &self.pty {
                        if let Err(err) = pty.write_all(text.as_bytes()) {
                            log::warn!("pty write failed: {err}");
                        }
                    }
                }
                _ => {}
            },
            WindowEvent::KeyboardInput { event, is_synthetic: false, .. } => {
                self.handle_key(event);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    winit::event::MouseScrollDelta::LineDelta(_, y) => y as isize,
                    winit::event::MouseScrollDelta::PixelDelta(pos) => (pos.y / 16.0) as isize,
                };
                if lines != 0 {
                    self.terminal.lock().unwrap().scroll_viewport(lines);
                    if let Some(window) = &self.window {
                        window.request_redraw();
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = &mut self.renderer {
                    if let Err(err) = renderer.render(&self.terminal, self.focused) {
                        // The frame is lost; the next redraw starts clean.
                        log::error!("frame aborted: {err}");
                    }
                }
            }
            _ => {}
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let event_loop = match EventLoop::<WindowMessage>::with_user_event().build() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            log::error!("failed to create event loop: {err}");
            std::process::exit(1);
        }
    };
    let proxy = event_loop.create_proxy();

    let mut app = App::new(proxy);
    if let Err(err) = event_loop.run_app(&mut app) {
        log::error!("event loop error: {err}");
        std::process::exit(1);
    }
}
