// Keyboard state
//
// The key-down table lives here and is handed to the update step by
// reference. Nothing about input is global.

use std::collections::HashSet;
use winit::event::ElementState;
use winit::keyboard::KeyCode;

#[derive(Debug, Default)]
pub struct InputState {
    down: HashSet<KeyCode>,
}

impl InputState {
    pub fn handle_key(&mut self, key: KeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => {
                self.down.insert(key);
            }
            ElementState::Released => {
                self.down.remove(&key);
            }
        }
    }

    pub fn is_down(&self, key: KeyCode) -> bool {
        self.down.contains(&key)
    }

    /// Forget every held key (e.g. when the window loses focus and release
    /// events will never arrive)
    pub fn clear(&mut self) {
        self.down.clear();
    }
}

/// What the render loop should do after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Quit,
}

/// Per-iteration update. No GPU work happens here yet.
pub fn update(input: &InputState, quit_key: Option<KeyCode>) -> Action {
    match quit_key {
        Some(key) if input.is_down(key) => Action::Quit,
        _ => Action::Continue,
    }
}

/// Map a key name from config.toml to a physical key code
pub fn parse_key_code(name: &str) -> Option<KeyCode> {
    let key = match name.trim().to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "enter" | "return" => KeyCode::Enter,
        "space" => KeyCode::Space,
        "backspace" => KeyCode::Backspace,
        "tab" => KeyCode::Tab,
        "q" => KeyCode::KeyQ,
        "x" => KeyCode::KeyX,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_and_release() {
        let mut input = InputState::default();
        assert!(!input.is_down(KeyCode::KeyQ));

        input.handle_key(KeyCode::KeyQ, ElementState::Pressed);
        assert!(input.is_down(KeyCode::KeyQ));

        // Key repeat delivers Pressed again
        input.handle_key(KeyCode::KeyQ, ElementState::Pressed);
        input.handle_key(KeyCode::KeyQ, ElementState::Released);
        assert!(!input.is_down(KeyCode::KeyQ));
    }

    #[test]
    fn clear_drops_held_keys() {
        let mut input = InputState::default();
        input.handle_key(KeyCode::Space, ElementState::Pressed);
        input.handle_key(KeyCode::Escape, ElementState::Pressed);
        input.clear();
        assert!(!input.is_down(KeyCode::Space));
        assert!(!input.is_down(KeyCode::Escape));
    }

    #[test]
    fn update_quits_only_on_the_bound_key() {
        let mut input = InputState::default();
        assert_eq!(update(&input, Some(KeyCode::Escape)), Action::Continue);

        input.handle_key(KeyCode::Space, ElementState::Pressed);
        assert_eq!(update(&input, Some(KeyCode::Escape)), Action::Continue);

        input.handle_key(KeyCode::Escape, ElementState::Pressed);
        assert_eq!(update(&input, Some(KeyCode::Escape)), Action::Quit);
        assert_eq!(update(&input, None), Action::Continue);
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key_code("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key_code(" esc "), Some(KeyCode::Escape));
        assert_eq!(parse_key_code("F12"), Some(KeyCode::F12));
        assert_eq!(parse_key_code("q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key_code("hyper"), None);
    }
}
